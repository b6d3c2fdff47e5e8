//! In-process remote-reconfigure contract (SPEC_FULL.md §6).
//!
//! `original_source/src/main/remote.c` lets a running `pv` be reconfigured from another
//! invocation of the same binary (`pv -R <pid> ...`) via a SysV message queue. The message
//! transport itself is out of scope here (SPEC_FULL.md §1's non-goals exclude the outer
//! cross-process control-socket surface); what's kept is the semantic contract: which fields
//! of `Control` are safe to change mid-run and what applying a partial update means. This
//! gives the CLI layer and any future transport the same single entry point.

use state::{BarStyle, Control, State};
use std::sync::atomic::Ordering;

/// A sparse update to a running transfer's control options, mirroring the subset of
/// `remote_msg` fields the original treats as live-reconfigurable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlUpdate {
    pub rate_limit: Option<u64>,
    pub size: Option<u64>,
    pub interval: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub name: Option<String>,
    pub format_string: Option<String>,
    pub no_display: Option<bool>,
    pub show_stats: Option<bool>,
    pub bar_style: Option<BarStyle>,
}

impl ControlUpdate {
    pub fn is_empty(&self) -> bool {
        *self == ControlUpdate::default()
    }
}

/// Applies a remote update to `state.control`, returning the set of field names actually
/// changed (for logging). Unknown/absent fields are left untouched; this is a merge, not a
/// replace, the same as `pv_remote_set`'s per-field application.
pub fn apply(state: &mut State, update: &ControlUpdate) -> Vec<&'static str> {
    let mut changed = Vec::new();
    let control = &mut state.control;

    if let Some(v) = update.rate_limit {
        control.rate_limit = v;
        changed.push("rate_limit");
    }
    if let Some(v) = update.size {
        control.size = v;
        changed.push("size");
    }
    if let Some(v) = update.interval {
        control.interval = v;
        changed.push("interval");
    }
    if let Some(v) = update.width {
        control.width = v;
        control.width_set_manually = true;
        changed.push("width");
    }
    if let Some(v) = update.height {
        control.height = v;
        control.height_set_manually = true;
        changed.push("height");
    }
    if let Some(ref v) = update.name {
        control.name = Some(v.clone());
        changed.push("name");
    }
    if let Some(ref v) = update.format_string {
        control.format_string = Some(v.clone());
        changed.push("format_string");
    }
    if let Some(v) = update.no_display {
        control.no_display = v;
        changed.push("no_display");
    }
    if let Some(v) = update.show_stats {
        control.show_stats = v;
        changed.push("show_stats");
    }
    if let Some(v) = update.bar_style {
        control.bar_style = v;
        changed.push("bar_style");
    }

    if !changed.is_empty() {
        state.transient.reparse_display.store(true, Ordering::SeqCst);
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::Control;

    #[test]
    fn apply_merges_only_present_fields() {
        let mut state = State::new("pv", Control::default());
        let update = ControlUpdate { rate_limit: Some(1024), ..ControlUpdate::default() };
        let changed = apply(&mut state, &update);
        assert_eq!(changed, vec!["rate_limit"]);
        assert_eq!(state.control.rate_limit, 1024);
        assert_eq!(state.control.size, 0);
    }

    #[test]
    fn empty_update_changes_nothing() {
        let mut state = State::new("pv", Control::default());
        let changed = apply(&mut state, &ControlUpdate::default());
        assert!(changed.is_empty());
    }
}
