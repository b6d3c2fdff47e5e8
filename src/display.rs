//! Display driver (SPEC_FULL.md §4.8).
//!
//! Ported from `pv_display`, `pv_in_foreground` and `pv_screensize` in
//! `original_source/src/pv/display.c`. Owns the compiled `format::Plan`, renders one line per
//! tick and writes it to stderr, choosing between the normal carriage-return-driven mode, a
//! plain newline-per-line mode (when stderr isn't a terminal or `--force` wasn't given), and
//! a bare-numeric mode (`-n`).

use std::io::{self, Write};
use std::os::unix::io::RawFd;

use libc;

use calc;
use cursor;
use error::Result;
use error::Error;
use format::{self, Plan};
use si;
use state::{DisplaySwitches, State};

/// Owns the compiled segment plan. Cross-instance cursor coordination state lives on
/// `State::cursor` itself (SPEC_FULL.md §3), since it must survive a SIGCONT-driven reinit
/// that the display object doesn't otherwise need to know about.
pub struct Display {
    plan: Plan,
    cursor_active: bool,
}

fn screen_width(fallback: u32) -> u32 {
    unsafe {
        let mut ws: libc::winsize = ::std::mem::zeroed();
        if libc::ioctl(libc::STDERR_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 && ws.ws_col > 0 {
            return ws.ws_col as u32;
        }
    }
    fallback
}

/// True when this process is in the foreground process group of its controlling terminal,
/// i.e. writing to stderr won't raise SIGTTOU (`pv_in_foreground`).
fn in_foreground() -> bool {
    unsafe {
        if libc::isatty(libc::STDERR_FILENO) == 0 {
            return true;
        }
        let pgrp = libc::tcgetpgrp(libc::STDERR_FILENO);
        pgrp == libc::getpgrp()
    }
}

/// Builds the `-n`/`--numeric` output line: one space-separated field per active switch
/// (`pv__format_numeric`), falling back to a bare percentage when neither `--bytes` nor
/// `--rate` was given.
fn numeric_line(state: &State) -> String {
    let switches = state.control.display_switches;
    let mut fields = Vec::new();
    let mut show_percentage = true;

    if switches.contains(DisplaySwitches::TIMER) {
        fields.push(format!("{:.4}", state.transfer.elapsed_seconds));
    }
    if switches.contains(DisplaySwitches::BYTES) {
        let multiplier = if state.control.bits { 8 } else { 1 };
        fields.push((multiplier * state.transfer.transferred as i64).to_string());
        show_percentage = false;
    }
    if switches.contains(DisplaySwitches::RATE) {
        let multiplier = if state.control.bits { 8.0 } else { 1.0 };
        fields.push(format!("{:.4}", multiplier * state.calc.transfer_rate));
        show_percentage = false;
    }
    if show_percentage {
        fields.push(state.calc.percentage.to_string());
    }

    format!("{}\n", fields.join(" "))
}

impl Display {
    pub fn new(state: &mut State) -> Self {
        let plan = match state.control.format_string.clone() {
            Some(ref spec) => format::compile(spec, &state.control, &mut state.display),
            None => format::default_plan(&state.control),
        };
        if state.control.cursor {
            state.cursor = cursor::attach(&state.control);
        }
        Display { plan, cursor_active: state.control.cursor }
    }

    /// Refreshes `state.control.width`/`height` from the terminal, if it wasn't pinned by
    /// `--width`/`--height`, in response to a SIGWINCH-driven reparse (SPEC_FULL.md §4.2).
    pub fn reload_size(&self, state: &mut State) {
        if !state.control.width_set_manually {
            state.control.width = screen_width(80);
        }
    }

    /// Renders and writes one display line, driven once per main-loop tick. Silently does
    /// nothing when `--no-display` was given or stderr is currently suspended by the SIGTTOU
    /// handler (SPEC_FULL.md §4.2's `suspend_stderr` flag).
    pub fn show(&mut self, state: &mut State) -> Result<()> {
        if state.control.no_display {
            return Ok(());
        }
        if state.transient.suspend_stderr.load(::std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        if state.control.wait && state.transfer.total_written == 0 {
            return Ok(());
        }

        let width = if state.control.width_set_manually { state.control.width } else { screen_width(80) } as usize;

        if state.control.numeric {
            let line = numeric_line(state);
            return self.write_line(state, line.as_bytes());
        }

        let rendered = format::render(&self.plan, state, width);

        let (prefix, suffix) = if self.cursor_active { cursor::decorate(&state.cursor) } else { (String::new(), String::new()) };

        let mut line = String::new();
        line.push_str(&prefix);
        line.push_str(&rendered);

        let is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) != 0 };
        line.push(if is_tty && !self.cursor_active { '\r' } else { '\n' });
        line.push_str(&suffix);

        self.write_line(state, line.as_bytes())
    }

    fn write_line(&self, state: &mut State, bytes: &[u8]) -> Result<()> {
        if !self.cursor_active && !in_foreground() {
            return Ok(());
        }
        let stderr = io::stderr();
        let mut handle = stderr.lock();
        if let Err(inner) = handle.write_all(bytes) {
            state.note_error(Error::Write { inner }.exit_bit());
        }
        let _ = handle.flush();
        Ok(())
    }

    /// Releases the cursor-coordination row, if one was claimed, called once as the main
    /// loop shuts down.
    pub fn finish(self, state: &mut State) {
        if self.cursor_active {
            cursor::detach(&mut state.cursor);
        }
    }

    /// Final summary line written on exit when `--show-stats`/`-W`-equivalent was given
    /// (SPEC_FULL.md §4.10 supplement), reporting mean/min/max/deviation transfer rate.
    pub fn show_final_stats(&self, state: &State) {
        if !state.control.show_stats {
            return;
        }
        if let Some((mean, deviation, _)) = calc::rate_stats(&state.calc) {
            let count_type = state.control.count_type();
            let unit = if state.control.bits { "b/s" } else { "/s" };
            let bytes_unit = if state.control.bits { "b/s" } else { "B/s" };
            eprintln!(
                "rate min/avg/max/mdev = {}/{}/{}/{}",
                si::sizestr(state.calc.rate_min, unit, bytes_unit, count_type),
                si::sizestr(mean, unit, bytes_unit, count_type),
                si::sizestr(state.calc.rate_max, unit, bytes_unit, count_type),
                si::sizestr(deviation, unit, bytes_unit, count_type),
            );
        }
    }
}

/// Convenience wrapper used by the main loops to bump the rate calculator and the display
/// together on each tick (SPEC_FULL.md §4.10).
pub fn tick(state: &mut State, display: &mut Display, output_fd: RawFd, final_update: bool) -> Result<()> {
    ::transfer::update_backpressure(state, output_fd);

    let elapsed = state.transfer.elapsed_seconds;
    let history_interval = state.control.history_interval;
    let total_written = state.transfer.total_written;
    let size = state.control.size;
    let initial_offset = state.transfer.initial_offset;
    let bits = state.control.bits;
    calc::calculate_transfer_rate(&mut state.calc, history_interval, elapsed, total_written, size, initial_offset, bits, final_update);

    if state.transient.terminal_resized.swap(false, ::std::sync::atomic::Ordering::SeqCst) {
        display.reload_size(state);
    }

    display.show(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::{Control, State};

    #[test]
    fn numeric_mode_renders_percentage_only() {
        let control = Control { numeric: true, size: 100, width_set_manually: true, width: 40, ..Control::default() };
        let mut state = State::new("pv", control);
        state.transfer.total_written = 50;
        state.calc.percentage = 50;
        let mut display = Display::new(&mut state);
        assert!(display.show(&mut state).is_ok());
    }

    #[test]
    fn default_plan_renders_without_panicking() {
        let control = Control { width_set_manually: true, width: 60, no_display: false, ..Control::default() };
        let mut state = State::new("pv", control);
        let mut display = Display::new(&mut state);
        assert!(display.show(&mut state).is_ok());
    }
}
