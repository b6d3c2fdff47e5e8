//! Unix pipeline progress viewer: forwards data verbatim between stdin/stdout (or watches
//! an already-running process's fd) while rendering a live progress line on stderr.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate strum_macros;
#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

extern crate clap;
extern crate env_logger;
extern crate failure;
extern crate libc;
extern crate nix;
extern crate serde;
extern crate strum;

pub mod calc;
pub mod cli;
pub mod cursor;
pub mod display;
pub mod elapsed;
pub mod error;
pub mod format;
pub mod loops;
pub mod remote;
pub mod si;
pub mod signal;
pub mod state;
pub mod transfer;

use error::Result;
use signal::SignalRouter;
use state::{Control, State};

/// Top-level entry point used by `main.rs`: builds a `State` from the parsed `Control`,
/// installs the signal router, and dispatches to whichever of the three main loops the
/// options select (SPEC_FULL.md §4.10).
pub fn run(control: Control) -> Result<u8> {
    let mut state = State::new("pv", control);
    // `state.transient` does not actually live for 'static, but `SignalRouter::install`
    // requires it: the handlers it registers only run for the lifetime of the `signals`
    // value below, which we drop (restoring the previous handlers) before `state` goes out
    // of scope at the end of this function.
    let transient: &'static state::Transient = unsafe { &*(&state.transient as *const state::Transient) };
    let signals = SignalRouter::install(transient);

    if state.control.watch_pid != 0 {
        if state.control.watch_fd >= 0 {
            loops::watchfd_loop(&mut state, &signals, state.control.watch_pid, state.control.watch_fd)?;
        } else {
            loops::watchpid_loop(&mut state, &signals, state.control.watch_pid)?;
        }
        return Ok(state.exit_status);
    }

    let output_fd = ::libc::STDOUT_FILENO;
    let (input_fd, _input_guard) = open_input(&mut state, output_fd)?;

    loops::main_loop(&mut state, &signals, input_fd, output_fd)?;

    Ok(state.exit_status)
}

/// Opens the first input source: stdin if no files were given, otherwise the first listed
/// file. Subsequent files, if any, are opened in turn by `transfer::advance_file` as each one
/// is exhausted, so this is only ever called once per run.
fn open_input(state: &mut State, output_fd: i32) -> Result<(i32, Option<::std::fs::File>)> {
    if state.control.input_files.is_empty() {
        return Ok((::libc::STDIN_FILENO, None));
    }
    let (fd, guard) = transfer::open_indexed_file(&state.control, 0, output_fd)?;
    state.transfer.current_input_file = 0;
    Ok((fd, guard))
}

/// Initializes the diagnostic logger (`RUST_LOG`-driven, via `env_logger`), kept entirely
/// separate from the user-visible stderr progress line that `display` owns.
pub fn init_logging() {
    let _ = env_logger::try_init();
    debug!("logging initialized");
}
