//! Progress-bar glyph sets and rendering (SPEC_FULL.md §4.7a).
//!
//! Ported from `original_source/src/pv/format/barstyle.c` (style tables) and
//! `original_source/src/pv/format/progressbar.c` (known-size / unknown-size rendering).

use state::{BarStyleSpec, Control, DisplayState, PV_BARSTYLE_MAX};

/// Resolves a bar-style name to its glyph table, falling back to the plain ASCII style for
/// an unrecognised name (`pv_barstyle`). UTF-8 styles are only returned when the control
/// allows UTF-8 output; otherwise they silently degrade to plain.
fn lookup(name: &str, can_display_utf8: bool) -> BarStyleSpec {
    if can_display_utf8 {
        match name {
            "block" => {
                return BarStyleSpec {
                    style_id: 2,
                    indicator: "\u{25c0}\u{25b6}".to_string(),
                    tip: String::new(),
                    filler: vec![" ".to_string(), "\u{2588}".to_string()],
                };
            }
            "granular" => {
                return BarStyleSpec {
                    style_id: 3,
                    indicator: "\u{25c0}\u{25b6}".to_string(),
                    tip: String::new(),
                    filler: vec![
                        " ".to_string(),
                        "\u{258f}".to_string(),
                        "\u{258e}".to_string(),
                        "\u{258d}".to_string(),
                        "\u{258c}".to_string(),
                        "\u{258b}".to_string(),
                        "\u{258a}".to_string(),
                        "\u{2589}".to_string(),
                        "\u{2588}".to_string(),
                    ],
                };
            }
            "shaded" => {
                return BarStyleSpec {
                    style_id: 4,
                    indicator: "\u{2592}\u{2593}\u{2592}".to_string(),
                    tip: String::new(),
                    filler: vec![
                        "\u{2591}".to_string(),
                        "\u{2592}".to_string(),
                        "\u{2593}".to_string(),
                        "\u{2588}".to_string(),
                    ],
                };
            }
            _ => {}
        }
    }
    BarStyleSpec {
        style_id: 1,
        indicator: "<=>".to_string(),
        tip: ">".to_string(),
        filler: vec![" ".to_string(), "=".to_string()],
    }
}

/// Returns the 1-based style parameter for `name`, adding it to `display.barstyle` if it
/// isn't cached yet (`pv_display_barstyle_index`). A full cache falls back to slot 0.
pub fn resolve_or_add(display: &mut DisplayState, control: &Control, name: &str) -> usize {
    let style = lookup(name, control.can_display_utf8);

    if let Some(idx) = display.barstyle.iter().position(|s| s.style_id == style.style_id) {
        return idx + 1;
    }
    if display.barstyle.len() >= PV_BARSTYLE_MAX {
        return 0;
    }
    display.barstyle.push(style);
    display.barstyle.len()
}

fn style_for_param<'a>(display: &'a DisplayState, control: &'a Control, param: usize) -> BarStyleSpec {
    if param == 0 {
        return lookup(&control.bar_style.to_string(), control.can_display_utf8);
    }
    display
        .barstyle
        .get(param - 1)
        .cloned()
        .unwrap_or_else(|| lookup("default", control.can_display_utf8))
}

/// Renders `width` columns of filled/unfilled bar, optionally with a leading/trailing
/// indicator bracket pair (`bar_sides`). `fraction` is the completed portion in `[0, 1]`
/// for known-size transfers.
fn render_known(style: &BarStyleSpec, width: usize, bar_sides: bool, fraction: f64) -> String {
    let levels = style.filler.len().max(1);
    let inner_width = if bar_sides { width.saturating_sub(2) } else { width };
    if inner_width == 0 {
        return String::new();
    }

    let total_subunits = inner_width * (levels - 1).max(1);
    let mut filled_subunits = ((total_subunits as f64) * fraction.max(0.0).min(1.0)).round() as usize;

    // Styles with a tip glyph reserve one cell's worth of fill for it, the same as
    // `pv_formatter_progress_knownsize`'s "leave room for the tip of the bar".
    let show_tip = !style.tip.is_empty();
    if show_tip && filled_subunits > 0 {
        filled_subunits -= (levels - 1).max(1);
    }

    let mut out = String::new();
    if bar_sides {
        out.push('[');
    }
    let mut tip_drawn = !show_tip;
    for col in 0..inner_width {
        let subunit_start = col * (levels - 1).max(1);
        let level = if levels <= 1 {
            if filled_subunits > subunit_start { 1 } else { 0 }
        } else if filled_subunits > subunit_start + (levels - 1) {
            levels - 1
        } else if filled_subunits > subunit_start {
            filled_subunits - subunit_start
        } else {
            0
        };
        if !tip_drawn && level == 0 {
            out.push_str(&style.tip);
            tip_drawn = true;
        } else {
            out.push_str(&style.filler[level]);
        }
    }
    if bar_sides {
        out.push(']');
    }
    out
}

/// Renders the back-and-forth moving indicator used when the size is unknown, driven by
/// `calc.percentage`'s 0-199 sweep (`pv_formatter_progress_unknownsize`).
fn render_unknown(style: &BarStyleSpec, width: usize, bar_sides: bool, percentage: u32) -> String {
    let inner_width = if bar_sides { width.saturating_sub(2) } else { width };
    let indicator_width = style.indicator.chars().count().max(1);
    if inner_width <= indicator_width {
        return style.indicator.clone();
    }
    let track_width = inner_width - indicator_width;

    let mut pos = (percentage % 200) as usize;
    if pos > 100 {
        pos = 200 - pos;
    }
    let before = (track_width * pos) / 100;
    let after = track_width - before;

    let mut out = String::new();
    if bar_sides {
        out.push('[');
    }
    for _ in 0..before {
        out.push_str(&style.filler[0]);
    }
    out.push_str(&style.indicator);
    for _ in 0..after {
        out.push_str(&style.filler[0]);
    }
    if bar_sides {
        out.push(']');
    }
    out
}

/// The bar portion only, no trailing percentage/rate (`pv_formatter_progress_bar_only`).
pub fn render_bar_only(
    display: &DisplayState,
    control: &Control,
    param: usize,
    width: usize,
    size_known: bool,
    fraction: f64,
    percentage: u32,
) -> String {
    let style = style_for_param(display, control, param);
    if size_known {
        render_known(&style, width, false, fraction)
    } else {
        render_unknown(&style, width, false, percentage)
    }
}

/// Full bar with surrounding brackets (`pv_formatter_progress`'s default sided rendering).
pub fn render_full(
    display: &DisplayState,
    control: &Control,
    param: usize,
    width: usize,
    size_known: bool,
    fraction: f64,
    percentage: u32,
) -> String {
    let style = style_for_param(display, control, param);
    if size_known {
        render_known(&style, width, true, fraction)
    } else {
        render_unknown(&style, width, true, percentage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::{BarStyle, Control};

    #[test]
    fn plain_style_falls_back_without_utf8() {
        let style = lookup("block", false);
        assert_eq!(style.style_id, 1);
    }

    #[test]
    fn block_style_resolves_with_utf8() {
        let style = lookup("block", true);
        assert_eq!(style.style_id, 2);
        assert_eq!(style.filler.len(), 2);
    }

    #[test]
    fn resolve_or_add_reuses_cached_slot() {
        let mut display = DisplayState::default();
        let control = Control { can_display_utf8: true, bar_style: BarStyle::Block, ..Control::default() };
        let a = resolve_or_add(&mut display, &control, "granular");
        let b = resolve_or_add(&mut display, &control, "granular");
        assert_eq!(a, b);
        assert_eq!(display.barstyle.len(), 1);
    }

    #[test]
    fn known_size_bar_shows_tip_at_zero_fraction() {
        let style = lookup("default", false);
        let bar = render_known(&style, 10, false, 0.0);
        assert_eq!(bar, format!(">{}", " ".repeat(9)));
    }

    #[test]
    fn known_size_bar_reserves_tip_cell_at_one_fraction() {
        let style = lookup("default", false);
        let bar = render_known(&style, 10, false, 1.0);
        assert_eq!(bar, format!("{}>", "=".repeat(9)));
    }

    #[test]
    fn block_style_has_no_tip_and_fills_completely() {
        let style = lookup("block", true);
        let bar = render_known(&style, 10, false, 1.0);
        assert_eq!(bar, "\u{2588}".repeat(10));
    }

    #[test]
    fn unknown_size_indicator_moves_back_and_forth() {
        let style = lookup("default", false);
        let at_0 = render_unknown(&style, 10, false, 0);
        let at_150 = render_unknown(&style, 10, false, 150);
        assert!(at_0.starts_with("<=>"));
        assert_ne!(at_0, at_150);
    }
}
