//! The three main loops (SPEC_FULL.md §4.10).
//!
//! Ported from `pv_main_loop`, `pv_watchfd_loop` and `pv_watchpid_loop` in
//! `original_source/src/pv/loop.c`. Each is a blocking, single-threaded pump: read a block,
//! write it back out, update the display, repeat until EOF or a signal asks us to stop.
//! Token-bucket rate limiting and the cursor/display tick cadence are shared between all
//! three; what differs is where the input fd comes from and when the loop decides the
//! transfer is finished.

use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use libc;

use elapsed::ElapsedTime;
use error::Result;
use remote;
use signal::SignalRouter;
use state::{State, RATE_BURST_WINDOW, RATE_GRANULARITY_NSEC};
use display;
use display::Display;
use transfer::{self, TransferOutcome};

/// Token-bucket rate limiter (SPEC_FULL.md §4.4): accrues `rate_limit` bytes of budget per
/// second, capped at a `RATE_BURST_WINDOW`-second burst, and sleeps when the transfer has
/// run ahead of its budget. Mirrors `pv_main_loop`'s rate-limiting block, which runs once
/// per `RATE_GRANULARITY_NSEC` tick.
struct RateLimiter {
    tokens: f64,
    last_refill: ElapsedTime,
}

impl RateLimiter {
    fn new() -> Self {
        RateLimiter { tokens: 0.0, last_refill: ElapsedTime::read() }
    }

    /// Tops up the bucket and, if it's still empty, sleeps until there's at least one
    /// byte's worth of budget, then returns how many bytes this tick may send — the whole
    /// point being that the caller passes this straight through as `transfer_block`'s
    /// `cansend` budget instead of gating on a flat `tokens >= 1.0` and then letting a whole
    /// buffer's worth through regardless of the actual balance.
    fn cansend(&mut self, rate_limit: u64) -> u64 {
        if rate_limit == 0 {
            return u64::max_value();
        }
        let burst_cap = rate_limit as f64 * RATE_BURST_WINDOW as f64;
        loop {
            let now = ElapsedTime::read();
            let dt = now.subtract(&self.last_refill).seconds();
            self.last_refill = now;
            self.tokens = (self.tokens + dt * rate_limit as f64).min(burst_cap);
            if self.tokens >= 1.0 {
                return self.tokens as u64;
            }
            thread::sleep(Duration::from_nanos(RATE_GRANULARITY_NSEC));
        }
    }

    /// Debits the tokens actually spent. `bytes` is always at most what `cansend` last
    /// returned, so the balance never runs away into unbounded debt.
    fn spend(&mut self, bytes: u64) {
        self.tokens -= bytes as f64;
    }
}

/// Checks for a pending remote-reconfigure signal (SPEC_FULL.md §4.10) and applies it if
/// one is queued. The message transport is out of scope (SPEC_FULL.md §6); what's wired here
/// is the in-process contract: a `SIGUSR2` marks a reconfigure as pending, and the update
/// itself is whatever was left in `state.remote_update` by the same process's `--remote`
/// handling or an embedder calling `State::queue_remote_update`.
fn check_remote(state: &mut State, signals: &SignalRouter) {
    if signals.take_rxusr2().is_none() {
        return;
    }
    if let Some(update) = state.take_pending_remote_update() {
        let changed = remote::apply(state, &update);
        if !changed.is_empty() {
            info!("remote reconfigure applied: {}", changed.join(", "));
        }
    }
}

fn update_elapsed(state: &mut State, start: &ElapsedTime, signals: &SignalRouter) {
    let now = ElapsedTime::read();
    let toffset = signals.toffset();
    let effective_start = start.add(&toffset);
    state.transfer.elapsed_seconds = now.subtract(&effective_start).seconds();
}

/// `pv_main_loop`: pumps bytes from `input_fd` to `output_fd` until EOF, honouring rate
/// limiting, the display tick, and the exit-signal flag. When more than one input file was
/// given, advances to the next one on EOF instead of stopping (SPEC_FULL.md §4.4's "file
/// advancement"), closing the exhausted file's guard as it takes up the next.
pub fn main_loop(state: &mut State, signals: &SignalRouter, input_fd: RawFd, output_fd: RawFd) -> Result<()> {
    let start = ElapsedTime::read();
    let mut display = Display::new(state);
    let mut limiter = RateLimiter::new();

    if state.control.delay_start > 0.0 {
        thread::sleep(Duration::from_secs_f64(state.control.delay_start));
    }

    let mut input_fd = input_fd;
    let mut _guard: Option<::std::fs::File> = None;

    loop {
        if state.transient.trigger_exit.load(::std::sync::atomic::Ordering::SeqCst) {
            break;
        }

        check_remote(state, signals);

        let cansend = limiter.cansend(state.control.rate_limit);

        let before = state.transfer.total_written;
        match transfer::transfer_block(state, input_fd, output_fd, cansend)? {
            TransferOutcome::Continue => {}
            TransferOutcome::Aborted => {
                update_elapsed(state, &start, signals);
                display::tick(state, &mut display, output_fd, true)?;
                break;
            }
            TransferOutcome::InputExhausted => match transfer::advance_file(state, output_fd)? {
                Some((next_fd, next_guard)) => {
                    input_fd = next_fd;
                    _guard = next_guard;
                }
                None => {
                    update_elapsed(state, &start, signals);
                    display::tick(state, &mut display, output_fd, true)?;
                    break;
                }
            },
        }
        limiter.spend(state.transfer.total_written - before);

        update_elapsed(state, &start, signals);
        display::tick(state, &mut display, output_fd, false)?;
    }

    display.show_final_stats(state);
    display.finish(state);
    Ok(())
}

/// `pv_watchfd_loop`: instead of reading stdin, periodically samples how far an already
/// running process's given fd has advanced (via `/proc/<pid>/fdinfo/<fd>`'s `pos:` line) and
/// displays that as progress, performing no data transfer of its own.
pub fn watchfd_loop(state: &mut State, signals: &SignalRouter, pid: u32, fd: i32) -> Result<()> {
    let start = ElapsedTime::read();
    let mut display = Display::new(state);

    loop {
        if state.transient.trigger_exit.load(::std::sync::atomic::Ordering::SeqCst) {
            break;
        }

        match read_fd_position(pid, fd) {
            Some(pos) => state.transfer.total_written = pos,
            None => break,
        }

        update_elapsed(state, &start, signals);
        display::tick(state, &mut display, 2, false)?;

        thread::sleep(Duration::from_secs_f64(state.control.interval.max(0.1)));
    }

    display.show_final_stats(state);
    display.finish(state);
    Ok(())
}

/// `pv_watchpid_loop`: like `watchfd_loop`, but tracks the sum of every fd a process has
/// open that targets a regular file, switching to the next one once the current target is
/// closed (e.g. a pipeline stage that processes files one at a time).
pub fn watchpid_loop(state: &mut State, signals: &SignalRouter, pid: u32) -> Result<()> {
    let start = ElapsedTime::read();
    let mut display = Display::new(state);

    loop {
        if state.transient.trigger_exit.load(::std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        if !process_alive(pid) {
            break;
        }

        if let Some(pos) = largest_open_file_position(pid) {
            state.transfer.total_written = pos;
        }

        update_elapsed(state, &start, signals);
        display::tick(state, &mut display, 2, false)?;

        thread::sleep(Duration::from_secs_f64(state.control.interval.max(0.1)));
    }

    display.show_final_stats(state);
    display.finish(state);
    Ok(())
}

fn read_fd_position(pid: u32, fd: i32) -> Option<u64> {
    let path = format!("/proc/{}/fdinfo/{}", pid, fd);
    let contents = ::std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("pos:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Scans `/proc/<pid>/fd/*` for the open file with the largest current offset, used as a
/// heuristic for "which file is this process actively working through" in watch-pid mode.
fn largest_open_file_position(pid: u32) -> Option<u64> {
    let dir = format!("/proc/{}/fd", pid);
    let entries = ::std::fs::read_dir(dir).ok()?;
    let mut best = None;
    for entry in entries.filter_map(|e| e.ok()) {
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() {
            if let Some(pos) = read_fd_position(pid, fd) {
                best = Some(best.map_or(pos, |b: u64| b.max(pos)));
            }
        }
    }
    best
}
