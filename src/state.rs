//! The state container (SPEC_FULL.md §3, §4.3).
//!
//! Ported from the struct layout in `original_source/src/include/pv-internal.h` and the
//! setters/allocator in `original_source/src/pv/state.c`. Where the original uses a single
//! `calloc`'d blob freed by `pv_state_free`, this crate uses ordinary owned `Vec`/`String`
//! fields dropped by `Drop`, so there is no separate free function.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use elapsed::ElapsedTime;
use remote::ControlUpdate;
use si::CountType;

pub const MAX_LINE_POSITIONS: usize = 100_000;
pub const PV_FORMAT_ARRAY_MAX: usize = 100;
pub const BUFFER_SIZE: usize = 409_600;
pub const BUFFER_SIZE_MAX: usize = 524_288;
pub const MAX_READ_AT_ONCE: usize = 524_288;
pub const MAX_WRITE_AT_ONCE: usize = 524_288;
pub const TRANSFER_READ_TIMEOUT_SECS: f64 = 0.09;
pub const TRANSFER_WRITE_TIMEOUT_SECS: f64 = 0.9;
pub const RATE_GRANULARITY_NSEC: u64 = 100_000_000;
pub const RATE_BURST_WINDOW: u64 = 5;
pub const LASTWRITTEN_BUFFER_SIZE: usize = 256;
pub const PREVIOUS_LINE_BUFFER_SIZE: usize = 1024;

/// Progress-bar character sets (SPEC_FULL.md §4.7a), grounded on `format/barstyle.c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BarStyle {
    Plain,
    Block,
    Granular,
    Shaded,
}

impl Default for BarStyle {
    fn default() -> Self {
        BarStyle::Plain
    }
}

bitflags! {
    /// Which display segments `-p`/`-t`/`-e`/... select when no `--format` string is given
    /// (SPEC_FULL.md §10). Unlike `Transient`'s flags these are set once at parse time and
    /// read-only afterwards, so a plain bitmask (rather than individual atomics) is the right
    /// fit.
    pub struct DisplaySwitches: u32 {
        const PROGRESS       = 0b0000_0000_0001;
        const TIMER          = 0b0000_0000_0010;
        const ETA            = 0b0000_0000_0100;
        const FINETA         = 0b0000_0000_1000;
        const RATE           = 0b0000_0001_0000;
        const AVERAGE_RATE   = 0b0000_0010_0000;
        const BYTES          = 0b0000_0100_0000;
        const BUFFER_PERCENT = 0b0000_1000_0000;
        const LAST_WRITTEN   = 0b0001_0000_0000;
    }
}

/// Immutable-during-a-run control options (SPEC_FULL.md §3), mutable only via
/// `State::apply_remote` (SPEC_FULL.md §6).
#[derive(Debug, Clone)]
pub struct Control {
    pub size: u64,
    pub rate_limit: u64,
    pub target_buffer_size: usize,
    pub interval: f64,
    pub delay_start: f64,
    pub width: u32,
    pub width_set_manually: bool,
    pub height: u32,
    pub height_set_manually: bool,
    pub name: Option<String>,
    pub name_width: usize,
    pub format_string: Option<String>,
    pub extra_format_string: Option<String>,
    pub skip_errors: u32,
    pub error_skip_block: u64,
    pub average_rate_window: u32,
    pub history_len: usize,
    pub history_interval: u32,

    pub force: bool,
    pub cursor: bool,
    pub numeric: bool,
    pub wait: bool,
    pub rate_gauge: bool,
    pub linemode: bool,
    pub bits: bool,
    pub decimal_units: bool,
    pub null_terminated_lines: bool,
    pub no_display: bool,
    pub stop_at_size: bool,
    pub sync_after_write: bool,
    pub direct_io: bool,
    pub no_splice: bool,
    pub discard_input: bool,
    pub show_stats: bool,
    pub can_display_utf8: bool,
    pub bar_style: BarStyle,
    pub display_switches: DisplaySwitches,

    pub input_files: Vec<PathBuf>,
    pub watch_pid: u32,
    pub watch_fd: i32,
}

impl Default for Control {
    fn default() -> Self {
        Control {
            size: 0,
            rate_limit: 0,
            target_buffer_size: 0,
            interval: 1.0,
            delay_start: 0.0,
            width: 80,
            width_set_manually: false,
            height: 25,
            height_set_manually: false,
            name: None,
            name_width: 9,
            format_string: None,
            extra_format_string: None,
            skip_errors: 0,
            error_skip_block: 0,
            average_rate_window: 30,
            history_len: 7,
            history_interval: 5,
            force: false,
            cursor: false,
            numeric: false,
            wait: false,
            rate_gauge: false,
            linemode: false,
            bits: false,
            decimal_units: false,
            null_terminated_lines: false,
            no_display: false,
            stop_at_size: false,
            sync_after_write: false,
            direct_io: false,
            no_splice: false,
            discard_input: false,
            show_stats: false,
            can_display_utf8: false,
            bar_style: BarStyle::Plain,
            display_switches: DisplaySwitches::empty(),
            input_files: Vec::new(),
            watch_pid: 0,
            watch_fd: -1,
        }
    }
}

impl Control {
    /// Mirrors `pv_state_average_rate_window_set`: decomposes a window, in seconds, into
    /// a history slot count and an interval between slots.
    pub fn set_average_rate_window(&mut self, window_secs: u32) {
        let val = window_secs.max(1);
        if val >= 20 {
            self.history_len = (val / 5 + 1) as usize;
            self.history_interval = 5;
        } else {
            self.history_len = (val + 1) as usize;
            self.history_interval = 1;
        }
        self.average_rate_window = val;
    }

    pub fn count_type(&self) -> CountType {
        if self.linemode {
            CountType::Lines
        } else if self.decimal_units {
            CountType::DecimalBytes
        } else {
            CountType::Bytes
        }
    }
}

/// Flags set by signal handlers and polled once per tick by the main loop (SPEC_FULL.md §3).
/// Each field must be independently readable/writable from a signal handler, hence `AtomicBool`
/// rather than a `bitflags!` bitmask (which has no atomic update primitive).
#[derive(Debug, Default)]
pub struct Transient {
    pub reparse_display: AtomicBool,
    pub terminal_resized: AtomicBool,
    pub trigger_exit: AtomicBool,
    pub clear_tty_tostop_on_exit: AtomicBool,
    pub suspend_stderr: AtomicBool,
    pub skip_next_sigcont: AtomicBool,
    pub pipe_closed: AtomicBool,
}

impl Transient {
    pub fn new() -> Self {
        let t = Transient::default();
        t.reparse_display.store(true, Ordering::SeqCst);
        t
    }
}

/// Per-fd adaptive read-error-skip bookkeeping (SPEC_FULL.md §4.4, §9).
#[derive(Debug, Default, Clone)]
pub struct ReadErrorSkip {
    pub fd: i32,
    pub errors_in_a_row: u32,
    pub warning_shown: bool,
    pub current_skip_block: u64,
}

/// Transfer counters and the transfer buffer itself (SPEC_FULL.md §3).
#[derive(Debug)]
pub struct TransferState {
    pub buffer: Vec<u8>,
    pub buffer_size: usize,

    pub total_written: u64,
    pub transferred: u64,
    pub written_but_not_consumed: u64,

    pub elapsed_seconds: f64,
    pub toffset: ElapsedTime,

    pub read_error_skip: ReadErrorSkip,
    pub splice_failed_fd: i32,
    pub splice_used: bool,

    /// Circular buffer of `total_written` values recorded at each line terminator.
    pub line_positions: Vec<u64>,
    pub line_positions_head: usize,
    pub line_positions_filled: usize,

    pub current_input_file: i32,
    pub initial_offset: u64,
}

impl Default for TransferState {
    fn default() -> Self {
        TransferState {
            buffer: Vec::new(),
            buffer_size: 0,
            total_written: 0,
            transferred: 0,
            written_but_not_consumed: 0,
            elapsed_seconds: 0.0,
            toffset: ElapsedTime::zero(),
            read_error_skip: ReadErrorSkip { fd: -1, ..Default::default() },
            splice_failed_fd: -1,
            splice_used: false,
            line_positions: vec![0; MAX_LINE_POSITIONS],
            line_positions_head: 0,
            line_positions_filled: 0,
            current_input_file: -1,
            initial_offset: 0,
        }
    }
}

impl TransferState {
    /// Records a line terminator at the current `total_written` value, dropping the
    /// oldest entry once the ring is full (SPEC_FULL.md §3's `line_positions`).
    pub fn record_line_position(&mut self) {
        self.line_positions[self.line_positions_head] = self.total_written;
        self.line_positions_head = (self.line_positions_head + 1) % MAX_LINE_POSITIONS;
        if self.line_positions_filled < MAX_LINE_POSITIONS {
            self.line_positions_filled += 1;
        }
    }

    /// Walks `line_positions` backwards to translate a byte-level "not yet consumed"
    /// readback into a line count, per SPEC_FULL.md §4.4's back-pressure accounting.
    pub fn lines_not_consumed(&self, last_output_position: u64, written_but_not_consumed: u64) -> u64 {
        if written_but_not_consumed == 0 || self.line_positions_filled == 0 {
            return 0;
        }
        let threshold = last_output_position.saturating_sub(written_but_not_consumed);
        let mut count = 0u64;
        let mut idx = self.line_positions_head;
        for _ in 0..self.line_positions_filled {
            idx = if idx == 0 { MAX_LINE_POSITIONS - 1 } else { idx - 1 };
            if self.line_positions[idx] > threshold {
                count += 1;
            } else {
                break;
            }
        }
        count
    }
}

/// A single slot in the windowed-average rate history ring (SPEC_FULL.md §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct HistorySlot {
    pub elapsed_sec: f64,
    pub transferred: u64,
}

/// Rate-calculation scratch state (SPEC_FULL.md §3, §4.5).
#[derive(Debug)]
pub struct CalcState {
    pub transfer_rate: f64,
    pub average_rate: f64,
    pub prev_elapsed_sec: f64,
    pub prev_rate: f64,
    pub prev_trans: u64,
    pub prev_total_written: u64,
    pub current_avg_rate: f64,
    pub rate_min: f64,
    pub rate_max: f64,
    pub rate_sum: f64,
    pub ratesquared_sum: f64,
    pub measurements_taken: u64,
    pub percentage: u32,

    pub history: Vec<HistorySlot>,
    pub history_first: usize,
    pub history_last: usize,
}

impl CalcState {
    pub fn new(history_len: usize) -> Self {
        CalcState {
            transfer_rate: 0.0,
            average_rate: 0.0,
            prev_elapsed_sec: 0.0,
            prev_rate: 0.0,
            prev_trans: 0,
            prev_total_written: 0,
            current_avg_rate: 0.0,
            rate_min: 0.0,
            rate_max: 0.0,
            rate_sum: 0.0,
            ratesquared_sum: 0.0,
            measurements_taken: 0,
            percentage: 0,
            history: vec![HistorySlot::default(); history_len.max(1)],
            history_first: 0,
            history_last: 0,
        }
    }
}

/// One entry of a progress-bar character set, resolved once per distinct `%{style}p` token
/// and cached by style id (SPEC_FULL.md §4.7a), mirroring `struct pvbarstyle_s`.
#[derive(Debug, Clone)]
pub struct BarStyleSpec {
    pub style_id: u8,
    pub indicator: String,
    pub tip: String,
    pub filler: Vec<String>,
}

pub const PV_BARSTYLE_MAX: usize = 8;

/// Display-side scratch state (SPEC_FULL.md §3, §4.8), excluding the compiled format plan
/// (owned by `format::Plan`, which lives alongside this in `Display`).
#[derive(Debug, Default)]
pub struct DisplayState {
    pub display_buffer: String,
    pub lastwritten_buffer: Vec<u8>,
    pub previous_line: Vec<u8>,
    pub next_line: Vec<u8>,
    pub showing_timer: bool,
    pub showing_bytes: bool,
    pub showing_rate: bool,
    pub showing_last_written: bool,
    pub showing_previous_line: bool,
    pub display_visible: bool,
    pub prev_screen_width: u32,
    /// Cache of resolved bar styles, indexed by the `parameter` field a `%{style}p` segment
    /// is compiled with (1-based; 0 means "use the control-wide default style").
    pub barstyle: Vec<BarStyleSpec>,
}

/// Cross-instance coordination state (SPEC_FULL.md §3, §4.9).
#[derive(Debug, Default)]
pub struct CursorState {
    pub lock_file: Option<PathBuf>,
    pub lock_fd: i32,
    pub y_start: u32,
    pub shmid: i32,
    pub pvcount: u32,
    pub pvmax: u32,
    /// This instance's fixed slot number, assigned once at attach time.
    pub row: u32,
    pub y_lastread: u32,
    pub y_offset: u32,
    pub needreinit: bool,
    pub noipc: bool,
}

/// The full state container: the single owning root for a run (SPEC_FULL.md §4.3).
pub struct State {
    pub control: Control,
    pub transient: Transient,
    pub transfer: TransferState,
    pub calc: CalcState,
    pub display: DisplayState,
    pub cursor: CursorState,
    pub program_name: String,
    pub exit_status: u8,
    remote_update: Option<ControlUpdate>,
}

impl State {
    pub fn new(program_name: &str, control: Control) -> Self {
        let history_len = control.history_len;
        State {
            transient: Transient::new(),
            transfer: TransferState::default(),
            calc: CalcState::new(history_len),
            display: DisplayState::default(),
            cursor: CursorState { lock_fd: -1, shmid: -1, pvcount: 1, ..Default::default() },
            program_name: program_name.to_string(),
            exit_status: 0,
            remote_update: None,
            control,
        }
    }

    pub fn note_error(&mut self, bit: u8) {
        self.exit_status |= bit;
    }

    /// Queues a remote-reconfigure update, applied the next time a pending-reconfigure
    /// signal is observed (SPEC_FULL.md §6's in-process `State::apply_remote` contract).
    pub fn queue_remote_update(&mut self, update: ControlUpdate) {
        self.remote_update = Some(update);
    }

    /// Takes the queued remote update, if any, clearing it so it is only applied once.
    pub fn take_pending_remote_update(&mut self) -> Option<ControlUpdate> {
        self.remote_update.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_remote_update_is_taken_only_once() {
        let mut state = State::new("pv", Control::default());
        assert!(state.take_pending_remote_update().is_none());
        state.queue_remote_update(ControlUpdate { rate_limit: Some(512), ..ControlUpdate::default() });
        let taken = state.take_pending_remote_update();
        assert_eq!(taken.unwrap().rate_limit, Some(512));
        assert!(state.take_pending_remote_update().is_none());
    }

    #[test]
    fn average_rate_window_below_20_uses_1s_slots() {
        let mut c = Control::default();
        c.set_average_rate_window(10);
        assert_eq!(c.history_len, 11);
        assert_eq!(c.history_interval, 1);
    }

    #[test]
    fn average_rate_window_at_or_above_20_uses_5s_slots() {
        let mut c = Control::default();
        c.set_average_rate_window(30);
        assert_eq!(c.history_len, 7);
        assert_eq!(c.history_interval, 5);
    }

    #[test]
    fn line_position_ring_evicts_oldest_entry() {
        let mut t = TransferState::default();
        for i in 0..(MAX_LINE_POSITIONS as u64 + 5) {
            t.total_written = i;
            t.record_line_position();
        }
        assert_eq!(t.line_positions_filled, MAX_LINE_POSITIONS);
    }

    #[test]
    fn lines_not_consumed_counts_markers_past_threshold() {
        let mut t = TransferState::default();
        for i in 1..=10u64 {
            t.total_written = i * 100;
            t.record_line_position();
        }
        // last_output_position=1000, not_consumed=250 => threshold=750, lines beyond: 800,900,1000 = 3
        assert_eq!(t.lines_not_consumed(1000, 250), 3);
    }
}
