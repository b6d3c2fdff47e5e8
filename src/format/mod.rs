//! Format compiler, segment plan and formatter library (SPEC_FULL.md §4.6, §4.7, §4.7a).
//!
//! The compiler turns a format string into a `Plan` — a flat list of `Segment`s, each either
//! a literal run of text or a tagged formatter reference with a field width (ported from the
//! parse loop described for `pvdisplay_s.format[]` in `original_source/src/include/pv-internal.h`
//! and `original_source/src/pv/display.c`). The renderer is a two-pass process: the first pass
//! renders every fixed-width segment to learn how many columns remain, and the second pass
//! renders the auto-width (bar) segments into whatever is left, mirroring the original's
//! "lay out fixed fields, then fill the gauge" display strategy.

pub mod bar;

use libc;

use si;
use state::{
    CalcState, Control, DisplaySwitches, DisplayState, State, TransferState, LASTWRITTEN_BUFFER_SIZE,
    PREVIOUS_LINE_BUFFER_SIZE,
};

/// One compiled formatter reference (SPEC_FULL.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Literal(String),
    Timer,
    Eta,
    Fineta,
    Rate,
    AverageRate,
    Bytes,
    Progress,
    ProgressBarOnly,
    ProgressAmountOnly,
    BufferPercent,
    LastWritten,
    PreviousLine,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: Kind,
    /// 0 means "no explicit width" — auto-sized literals take their natural width, bar
    /// segments take whatever space remains after every other segment is rendered.
    pub width: usize,
    /// 1-based index into `DisplayState::barstyle`; 0 selects the control-wide default
    /// style. Only meaningful for `Progress`/`ProgressBarOnly`.
    pub style_param: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub segments: Vec<Segment>,
}

fn is_bar_kind(kind: &Kind) -> bool {
    match *kind {
        Kind::Progress | Kind::ProgressBarOnly => true,
        _ => false,
    }
}

/// Compiles `format_str` into a `Plan`, resolving any `%{style}p`/`%{style}P` bar-style
/// tokens against `display.barstyle` as it goes (adding new styles on first use).
pub fn compile(format_str: &str, control: &Control, display: &mut DisplayState) -> Plan {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = format_str.chars().peekable();

    macro_rules! flush_literal {
        () => {
            if !literal.is_empty() {
                segments.push(Segment { kind: Kind::Literal(literal.clone()), width: 0, style_param: 0 });
                literal.clear();
            }
        };
    }

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                literal.push('%');
                continue;
            }
            None => {
                literal.push('%');
                break;
            }
            _ => {}
        }

        let mut width_digits = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() {
                width_digits.push(d);
                chars.next();
            } else {
                break;
            }
        }
        let width: usize = width_digits.parse().unwrap_or(0);

        let mut style_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            while let Some(d) = chars.next() {
                if d == '}' {
                    break;
                }
                style_name.push(d);
            }
        }

        let letter = match chars.next() {
            Some(l) => l,
            None => {
                flush_literal!();
                break;
            }
        };

        let kind = match letter {
            't' => Kind::Timer,
            'e' => Kind::Eta,
            'I' => Kind::Fineta,
            'r' => Kind::Rate,
            'a' => Kind::AverageRate,
            'b' => Kind::Bytes,
            'p' => Kind::Progress,
            'P' => Kind::ProgressBarOnly,
            'c' => Kind::ProgressAmountOnly,
            'T' => Kind::BufferPercent,
            'A' => Kind::LastWritten,
            'L' => Kind::PreviousLine,
            'N' => Kind::Name,
            other => {
                literal.push('%');
                if !width_digits.is_empty() {
                    literal.push_str(&width_digits);
                }
                literal.push(other);
                continue;
            }
        };

        flush_literal!();

        let style_param = if !style_name.is_empty() && is_bar_kind(&kind) {
            bar::resolve_or_add(display, control, &style_name)
        } else {
            0
        };

        segments.push(Segment { kind, width, style_param });
    }

    flush_literal!();
    Plan { segments }
}

/// Builds the segment plan used whenever `--format` wasn't given. With no individual
/// `-p`/`-t`/`-e`/... switches either, this is the traditional fixed set (name?, timer, bytes,
/// rate, progress, eta); otherwise only the requested segments appear, in the original's fixed
/// display order (SPEC_FULL.md §10).
pub fn default_plan(control: &Control) -> Plan {
    let mut segments = Vec::new();
    if control.name.is_some() {
        segments.push(Segment { kind: Kind::Name, width: 0, style_param: 0 });
        segments.push(Segment { kind: Kind::Literal(": ".to_string()), width: 0, style_param: 0 });
    }

    let kinds = if control.display_switches.is_empty() {
        vec![Kind::Timer, Kind::Bytes, Kind::Rate, Kind::Progress, Kind::Eta]
    } else {
        let s = control.display_switches;
        let mut kinds = Vec::new();
        if s.contains(DisplaySwitches::TIMER) {
            kinds.push(Kind::Timer);
        }
        if s.contains(DisplaySwitches::BYTES) {
            kinds.push(Kind::Bytes);
        }
        if s.contains(DisplaySwitches::BUFFER_PERCENT) {
            kinds.push(Kind::BufferPercent);
        }
        if s.contains(DisplaySwitches::LAST_WRITTEN) {
            kinds.push(Kind::LastWritten);
        }
        if s.contains(DisplaySwitches::RATE) {
            kinds.push(Kind::Rate);
        }
        if s.contains(DisplaySwitches::AVERAGE_RATE) {
            kinds.push(Kind::AverageRate);
        }
        if s.contains(DisplaySwitches::PROGRESS) {
            kinds.push(Kind::Progress);
        }
        if s.contains(DisplaySwitches::ETA) {
            kinds.push(Kind::Eta);
        }
        if s.contains(DisplaySwitches::FINETA) {
            kinds.push(Kind::Fineta);
        }
        kinds
    };

    for (i, kind) in kinds.into_iter().enumerate() {
        if i > 0 {
            segments.push(Segment { kind: Kind::Literal(" ".to_string()), width: 0, style_param: 0 });
        }
        segments.push(Segment { kind, width: 0, style_param: 0 });
    }

    Plan { segments }
}

fn format_hms(total_secs: f64) -> String {
    let secs = total_secs.max(0.0) as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{}:{:02}:{:02}", h, m, s)
}

fn seconds_remaining(so_far: u64, size: u64, rate: f64) -> Option<f64> {
    if size == 0 || rate <= 0.0 || so_far >= size {
        return None;
    }
    let remaining = (size - so_far) as f64 / rate;
    if !remaining.is_finite() || remaining > 315_576_000.0 {
        return None;
    }
    Some(remaining)
}

fn fineta_string(remaining: f64) -> String {
    let now = unsafe { libc::time(::std::ptr::null_mut()) };
    let target = now + remaining as libc::time_t;
    let mut tm: libc::tm = unsafe { ::std::mem::zeroed() };
    unsafe {
        libc::localtime_r(&target, &mut tm);
    }
    format!("{:02}:{:02}:{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec)
}

fn render_timer(transfer: &TransferState) -> String {
    format_hms(transfer.elapsed_seconds)
}

fn render_eta(control: &Control, calc: &CalcState, transfer: &TransferState, width: usize) -> String {
    match seconds_remaining(transfer.transferred, control.size, calc.current_avg_rate) {
        Some(remaining) => format!("ETA {}", format_hms(remaining)),
        None => si::fit_width("", width),
    }
}

fn render_fineta(control: &Control, calc: &CalcState, transfer: &TransferState, width: usize) -> String {
    match seconds_remaining(transfer.transferred, control.size, calc.current_avg_rate) {
        Some(remaining) => format!("ETA {}", fineta_string(remaining)),
        None => si::fit_width("", width),
    }
}

fn render_rate(control: &Control, rate: f64) -> String {
    let adjusted = if control.bits { rate * 8.0 } else { rate };
    let count_type = control.count_type();
    let unit = if control.bits { "b/s" } else { "/s" };
    let bytes_unit = if control.bits { "b/s" } else { "B/s" };
    format!("[{}]", si::sizestr(adjusted, unit, bytes_unit, count_type))
}

fn render_bytes(control: &Control, transfer: &TransferState) -> String {
    si::sizestr(transfer.total_written as f64, "", "B", control.count_type())
}

fn render_buffer_percent(transfer: &TransferState) -> String {
    if transfer.buffer_size == 0 {
        return "  0%".to_string();
    }
    let pct = (100.0 * transfer.written_but_not_consumed as f64 / transfer.buffer_size as f64).round() as u32;
    format!("{:3}%", pct.min(100))
}

fn render_last_written(display: &DisplayState, width: usize) -> String {
    let text = si::printable_or_dot(&display.lastwritten_buffer);
    si::fit_width(&text, width.max(1))
}

fn render_previous_line(display: &DisplayState, width: usize) -> String {
    let text = si::printable_or_dot(&display.previous_line);
    si::fit_width(&text, width.max(1))
}

fn render_name(control: &Control) -> String {
    let name = control.name.clone().unwrap_or_default();
    si::fit_width(&name, control.name_width)
}

/// True for segments whose rendered width can't be known without first knowing how much
/// room the *other* segments took — i.e. the progress bar.
fn render_fixed(segment: &Segment, state: &State) -> Option<String> {
    match segment.kind {
        Kind::Literal(ref s) => Some(s.clone()),
        Kind::Timer => Some(render_timer(&state.transfer)),
        Kind::Eta => Some(render_eta(&state.control, &state.calc, &state.transfer, segment.width)),
        Kind::Fineta => Some(render_fineta(&state.control, &state.calc, &state.transfer, segment.width)),
        Kind::Rate => Some(render_rate(&state.control, state.calc.transfer_rate)),
        Kind::AverageRate => Some(render_rate(&state.control, state.calc.average_rate)),
        Kind::Bytes => Some(render_bytes(&state.control, &state.transfer)),
        Kind::BufferPercent => Some(render_buffer_percent(&state.transfer)),
        Kind::LastWritten => Some(render_last_written(&state.display, segment.width.max(LASTWRITTEN_BUFFER_SIZE))),
        Kind::PreviousLine => Some(render_previous_line(&state.display, segment.width.max(PREVIOUS_LINE_BUFFER_SIZE))),
        Kind::Name => Some(render_name(&state.control)),
        Kind::ProgressAmountOnly => {
            if state.control.size > 0 {
                Some(format!("{:3}%", state.calc.percentage.min(100)))
            } else {
                Some(String::new())
            }
        }
        Kind::Progress | Kind::ProgressBarOnly => None,
    }
}

/// Two-pass render of the whole plan into one display line (SPEC_FULL.md §4.8).
/// `total_width` is the terminal column budget to fill (`control.width`, or the fallback
/// when the size couldn't be auto-detected).
pub fn render(plan: &Plan, state: &State, total_width: usize) -> String {
    let mut rendered: Vec<Option<String>> = Vec::with_capacity(plan.segments.len());
    let mut fixed_width = 0usize;
    let mut bar_count = 0usize;

    for segment in &plan.segments {
        match render_fixed(segment, state) {
            Some(text) => {
                fixed_width += text.chars().count();
                rendered.push(Some(text));
            }
            None => {
                bar_count += 1;
                rendered.push(None);
            }
        }
    }

    let remaining = total_width.saturating_sub(fixed_width);
    let bar_width = if bar_count > 0 { (remaining / bar_count).max(1) } else { 0 };

    let mut out = String::new();
    for (segment, text) in plan.segments.iter().zip(rendered.into_iter()) {
        match text {
            Some(t) => out.push_str(&t),
            None => {
                let width = if segment.width > 0 { segment.width } else { bar_width };
                let size_known = state.control.size > 0 || state.control.rate_gauge;
                let fraction = if state.control.size > 0 {
                    state.transfer.total_written as f64 / state.control.size as f64
                } else if state.calc.rate_max > 0.0 {
                    state.calc.transfer_rate / state.calc.rate_max
                } else {
                    0.0
                };
                let rendered_bar = match segment.kind {
                    Kind::Progress => bar::render_full(
                        &state.display,
                        &state.control,
                        segment.style_param,
                        width,
                        size_known,
                        fraction,
                        state.calc.percentage,
                    ),
                    Kind::ProgressBarOnly => bar::render_bar_only(
                        &state.display,
                        &state.control,
                        segment.style_param,
                        width,
                        size_known,
                        fraction,
                        state.calc.percentage,
                    ),
                    _ => unreachable!(),
                };
                out.push_str(&rendered_bar);
            }
        }
    }

    // Padded to the full terminal width (not trimmed): since each tick overwrites the
    // previous line with a bare `\r`, a shorter new line must still blank out whatever of
    // the old, longer one would otherwise remain visible past its end.
    si::fit_width(&out, total_width)
}

/// Records the last `LASTWRITTEN_BUFFER_SIZE` bytes actually written, for the `%A` formatter.
pub fn note_last_written(display: &mut DisplayState, bytes: &[u8]) {
    let take = bytes.len().min(LASTWRITTEN_BUFFER_SIZE);
    display.lastwritten_buffer = bytes[bytes.len() - take..].to_vec();
}

/// Records the most recently completed line, for the `%L` formatter.
pub fn note_previous_line(display: &mut DisplayState, line: &[u8]) {
    let take = line.len().min(PREVIOUS_LINE_BUFFER_SIZE);
    display.previous_line = line[..take].to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::{Control, DisplaySwitches, DisplayState};

    #[test]
    fn default_plan_uses_fixed_set_with_no_switches() {
        let control = Control::default();
        let plan = default_plan(&control);
        let kinds: Vec<&Kind> = plan.segments.iter().map(|s| &s.kind).filter(|k| !matches!(k, Kind::Literal(_))).collect();
        assert_eq!(kinds, vec![&Kind::Timer, &Kind::Bytes, &Kind::Rate, &Kind::Progress, &Kind::Eta]);
    }

    #[test]
    fn default_plan_honours_individual_switches() {
        let mut control = Control::default();
        control.display_switches = DisplaySwitches::BYTES | DisplaySwitches::PROGRESS;
        let plan = default_plan(&control);
        let kinds: Vec<&Kind> = plan.segments.iter().map(|s| &s.kind).filter(|k| !matches!(k, Kind::Literal(_))).collect();
        assert_eq!(kinds, vec![&Kind::Bytes, &Kind::Progress]);
    }

    #[test]
    fn compiles_literal_and_percent_escape() {
        let control = Control::default();
        let mut display = DisplayState::default();
        let plan = compile("ab%%cd", &control, &mut display);
        assert_eq!(plan.segments, vec![Segment { kind: Kind::Literal("ab%cd".to_string()), width: 0, style_param: 0 }]);
    }

    #[test]
    fn compiles_known_formatter_letters() {
        let control = Control::default();
        let mut display = DisplayState::default();
        let plan = compile("%t %r", &control, &mut display);
        assert_eq!(plan.segments.len(), 3);
        assert_eq!(plan.segments[0].kind, Kind::Timer);
        assert_eq!(plan.segments[2].kind, Kind::Rate);
    }

    #[test]
    fn unknown_letter_is_kept_as_literal() {
        let control = Control::default();
        let mut display = DisplayState::default();
        let plan = compile("%Z", &control, &mut display);
        assert_eq!(plan.segments, vec![Segment { kind: Kind::Literal("%Z".to_string()), width: 0, style_param: 0 }]);
    }

    #[test]
    fn bar_style_token_resolves_and_caches() {
        let control = Control { can_display_utf8: true, ..Control::default() };
        let mut display = DisplayState::default();
        let plan = compile("%{block}p", &control, &mut display);
        assert_eq!(plan.segments[0].kind, Kind::Progress);
        assert_eq!(plan.segments[0].style_param, 1);
        assert_eq!(display.barstyle.len(), 1);
    }

    #[test]
    fn format_hms_rolls_over_minutes_and_hours() {
        assert_eq!(format_hms(3725.0), "1:02:05");
    }
}
