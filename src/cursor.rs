//! Cross-instance cursor coordination (SPEC_FULL.md §4.9).
//!
//! Grounded on the `pvcursorstate_s` layout in `original_source/src/include/pv-internal.h`
//! and the cursor functions prototyped alongside `pv_display` in `display.c`. Multiple `pv`
//! instances attached to the same terminal coordinate which screen row each one's progress
//! line occupies by sharing a small SysV shared-memory segment (reached directly via `libc`,
//! the same raw-syscall idiom the teacher uses for perf fds) keyed off the controlling
//! terminal's device number, guarded by an advisory lock on a well-known file so the
//! "claim a row" read-modify-write is atomic across processes.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use libc;

use state::{Control, CursorState, State};

#[repr(C)]
struct SharedLayout {
    pvcount: u32,
    pvmax: u32,
    y_topmost: u32,
}

/// Per-user lock path, so one user's `--cursor` instances can't contend on (or be starved
/// by) another user's shared-memory segment on a multi-user terminal server.
fn lock_path() -> String {
    let uid = unsafe { libc::getuid() };
    format!("/tmp/pv-{}.lock", uid)
}

fn ftok_key() -> libc::key_t {
    let path = CString::new(lock_path()).unwrap();
    unsafe { libc::ftok(path.as_ptr(), b'p' as libc::c_int) }
}

fn open_lock() -> Option<RawFd> {
    let path = CString::new(lock_path()).unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
    if fd < 0 {
        None
    } else {
        Some(fd)
    }
}

fn lock(fd: RawFd) {
    unsafe {
        libc::flock(fd, libc::LOCK_EX);
    }
}

fn unlock(fd: RawFd) {
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
}

/// Attaches to (creating if necessary) the shared cursor-position segment and claims the
/// next free row. Falls back to `noipc` single-instance behaviour (own row 0, no shared
/// counting) on any shmget/shmat/lock failure rather than treating it as fatal, matching the
/// original's graceful degradation when `--cursor` is used without IPC support.
pub fn attach(control: &Control) -> CursorState {
    let mut cursor = CursorState { lock_fd: -1, shmid: -1, pvcount: 1, ..CursorState::default() };

    let lock_fd = match open_lock() {
        Some(fd) => fd,
        None => {
            cursor.noipc = true;
            return cursor;
        }
    };
    lock(lock_fd);

    let key = ftok_key();
    let size = ::std::mem::size_of::<SharedLayout>();
    let mut shmid = unsafe { libc::shmget(key, size, 0o600) };
    if shmid < 0 {
        shmid = unsafe { libc::shmget(key, size, libc::IPC_CREAT | 0o600) };
    }
    if shmid < 0 {
        unlock(lock_fd);
        cursor.lock_fd = lock_fd;
        cursor.noipc = true;
        return cursor;
    }

    let ptr = unsafe { libc::shmat(shmid, ::std::ptr::null(), 0) };
    if ptr as isize == -1 {
        unlock(lock_fd);
        cursor.lock_fd = lock_fd;
        cursor.noipc = true;
        return cursor;
    }

    let shared = ptr as *mut SharedLayout;
    unsafe {
        if (*shared).pvmax == 0 {
            (*shared).pvcount = 0;
            (*shared).pvmax = 0;
            (*shared).y_topmost = 0;
        }
        let row = (*shared).pvcount;
        (*shared).pvcount += 1;
        if (*shared).pvcount > (*shared).pvmax {
            (*shared).pvmax = (*shared).pvcount;
        }
        cursor.row = row;
        cursor.y_lastread = (*shared).y_topmost;
        cursor.y_offset = row.saturating_sub((*shared).y_topmost);
        cursor.pvcount = (*shared).pvcount;
        cursor.pvmax = (*shared).pvmax;
        libc::shmdt(ptr);
    }

    cursor.shmid = shmid;
    cursor.lock_fd = lock_fd;
    unlock(lock_fd);
    let _ = control.name_width;
    cursor
}

/// Releases this instance's claimed row so a later-started instance can reuse it, mirroring
/// `pv_cursor_fini`. Decrements the shared counter but leaves `pvmax` alone, since another
/// still-running instance may be relying on it to size the terminal region it clears.
pub fn detach(cursor: &mut CursorState) {
    if cursor.noipc || cursor.shmid < 0 {
        if cursor.lock_fd >= 0 {
            unsafe {
                libc::close(cursor.lock_fd);
            }
        }
        return;
    }
    lock(cursor.lock_fd);
    let size = ::std::mem::size_of::<SharedLayout>();
    let ptr = unsafe { libc::shmat(cursor.shmid, ::std::ptr::null(), 0) };
    if ptr as isize != -1 {
        let shared = ptr as *mut SharedLayout;
        unsafe {
            if (*shared).pvcount > 0 {
                (*shared).pvcount -= 1;
            }
            // If we were the topmost surviving instance, shift the anchor row down by one
            // so the instances below us move up to fill the gap we leave behind.
            if cursor.row == (*shared).y_topmost && (*shared).pvcount > 0 {
                (*shared).y_topmost += 1;
            }
            libc::shmdt(ptr);
            if (*shared).pvcount == 0 {
                libc::shmctl(cursor.shmid, libc::IPC_RMID, ::std::ptr::null_mut());
            }
        }
    }
    let _ = size;
    unlock(cursor.lock_fd);
    unsafe {
        libc::close(cursor.lock_fd);
    }
}

/// The ANSI escape pair that brackets a rendered display line when cursor mode is active:
/// save the cursor, move down to this instance's row, then (after the caller writes its
/// line) restore the cursor to where it started. Single-instance (`y_offset == 0`) mode
/// needs no movement at all beyond the usual carriage return.
pub fn decorate(cursor: &CursorState) -> (String, String) {
    if cursor.y_offset == 0 {
        return (String::new(), String::new());
    }
    let prefix = format!("\x1b7\x1b[{}B\r", cursor.y_offset);
    let suffix = "\x1b8".to_string();
    (prefix, suffix)
}

/// Re-derives this instance's display offset after a terminal resize or SIGCONT-driven
/// reinit (SPEC_FULL.md §4.2's `needreinit`). The instance's absolute row (`cursor.row`) is
/// fixed at attach time, but the shared anchor row (`y_topmost`) moves down whenever an
/// earlier-attached instance detaches, so `y_offset` — the offset actually used to position
/// the cursor — is re-read from shared memory and only updated when it has changed.
pub fn reinit_if_needed(state: &mut State) {
    if !state.cursor.needreinit {
        return;
    }
    state.cursor.needreinit = false;

    if state.cursor.noipc || state.cursor.shmid < 0 {
        return;
    }

    lock(state.cursor.lock_fd);
    let ptr = unsafe { libc::shmat(state.cursor.shmid, ::std::ptr::null(), 0) };
    if ptr as isize != -1 {
        let shared = ptr as *const SharedLayout;
        let topmost = unsafe { (*shared).y_topmost };
        unsafe {
            libc::shmdt(ptr);
        }
        if topmost != state.cursor.y_lastread {
            state.cursor.y_offset = state.cursor.row.saturating_sub(topmost);
            state.cursor.y_lastread = topmost;
        }
    }
    unlock(state.cursor.lock_fd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::Control;

    #[test]
    fn decorate_is_empty_for_row_zero() {
        let cursor = CursorState { y_offset: 0, ..CursorState::default() };
        let (prefix, suffix) = decorate(&cursor);
        assert!(prefix.is_empty());
        assert!(suffix.is_empty());
    }

    #[test]
    fn decorate_moves_cursor_down_for_nonzero_row() {
        let cursor = CursorState { y_offset: 3, ..CursorState::default() };
        let (prefix, _) = decorate(&cursor);
        assert!(prefix.contains("3B"));
    }

    #[test]
    fn attach_falls_back_gracefully_when_ipc_unavailable() {
        let control = Control::default();
        let cursor = attach(&control);
        assert!(cursor.shmid >= -1);
    }

    #[test]
    fn lock_path_is_scoped_to_the_current_user() {
        let path = lock_path();
        let uid = unsafe { libc::getuid() };
        assert_eq!(path, format!("/tmp/pv-{}.lock", uid));
    }

    #[test]
    fn reinit_without_ipc_clears_needreinit_and_leaves_offset_alone() {
        use state::{Control, State};
        let mut state = State::new("pv", Control::default());
        state.cursor.noipc = true;
        state.cursor.needreinit = true;
        state.cursor.y_offset = 2;
        reinit_if_needed(&mut state);
        assert!(!state.cursor.needreinit);
        assert_eq!(state.cursor.y_offset, 2);
    }
}
