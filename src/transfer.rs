//! Transfer engine and pre-count helper (SPEC_FULL.md §4.4, §4.11).
//!
//! Ported from the transfer section of `original_source/src/pv/loop.c` and the size/line
//! pre-counting helpers in `original_source/src/pv/file.c`. The engine is a single-threaded
//! read/write pump: one pass through `transfer_block` reads as much as fits in the buffer,
//! writes it back out, and updates the counters the display and rate calculator read from.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use libc;

use error::{Error, Result};
use format;
use state::{Control, ReadErrorSkip, State, TransferState, BUFFER_SIZE, MAX_READ_AT_ONCE, MAX_WRITE_AT_ONCE};

/// Result of one `transfer_block` call, telling the main loop whether to keep pumping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Continue,
    InputExhausted,
    Aborted,
}

/// Returns the number of bytes sitting unread in the kernel pipe buffer for `fd`, via
/// `FIONREAD` (`pv_calc_total_lines`'s sibling back-pressure probe in the original).
fn fionread(fd: RawFd) -> io::Result<u64> {
    let mut pending: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending as *mut libc::c_int) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pending.max(0) as u64)
}

/// Grows the transfer buffer to `new_size`, capped at `state.control.target_buffer_size`
/// when that override is non-zero, mirroring `pv_bufsize` reallocation in `pv_main_loop`.
fn ensure_buffer_size(transfer: &mut TransferState, wanted: usize, cap: usize) {
    let target = if cap > 0 { wanted.min(cap) } else { wanted };
    if transfer.buffer.len() < target {
        transfer.buffer.resize(target, 0);
        transfer.buffer_size = target;
    }
}

/// Reads once into the transfer buffer, applying the adaptive read-error-skip policy
/// (SPEC_FULL.md §9): transient errors are skipped up to `skip_errors` times in a row before
/// being promoted to a hard failure, each skip advancing past `error_skip_block` bytes of
/// presumed-bad input via a seek.
fn read_once(fd: RawFd, buf: &mut [u8], skip: &mut ReadErrorSkip, skip_errors: u32, skip_block: u64) -> Result<usize> {
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc >= 0 {
            skip.errors_in_a_row = 0;
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if skip_errors > 0 && skip.errors_in_a_row < skip_errors {
            skip.errors_in_a_row += 1;
            if skip_block > 0 {
                unsafe {
                    libc::lseek(fd, skip_block as libc::off_t, libc::SEEK_CUR);
                }
                skip.current_skip_block += skip_block;
            }
            continue;
        }
        return Err(Error::Read { inner: err });
    }
}

/// Writes the whole of `buf` to `fd`, retrying on `EINTR` and short writes, mirroring
/// `pv_write_retry`. SIGPIPE is ignored by the signal router, so a broken pipe on the
/// downstream consumer surfaces here as a plain `EPIPE` write error.
fn write_all(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let mut written = 0usize;
    while written < buf.len() {
        let chunk = (buf.len() - written).min(MAX_WRITE_AT_ONCE);
        let rc = unsafe { libc::write(fd, buf[written..written + chunk].as_ptr() as *const libc::c_void, chunk) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Write { inner: err });
        }
        written += rc as usize;
    }
    Ok(written)
}

/// Scans `buf[..len]` for line terminators, recording each one in `transfer.line_positions`
/// and updating the last-written/previous-line display snapshots (SPEC_FULL.md §4.4's line
/// mode bookkeeping).
fn record_lines(state: &mut State, buf: &[u8]) {
    let terminator = if state.control.null_terminated_lines { 0u8 } else { b'\n' };
    let mut start = 0usize;
    for (i, &byte) in buf.iter().enumerate() {
        if byte == terminator {
            format::note_previous_line(&mut state.display, &buf[start..i]);
            state.transfer.record_line_position();
            start = i + 1;
        }
    }
}

/// Transfers one block: read from `input_fd`, write to `output_fd`, update every counter
/// the display/rate layers depend on. Returns `InputExhausted` at EOF.
///
/// `cansend` bounds how many bytes this single call may move, so a rate-limited caller gets
/// one bounded transfer per tick (`min(MAX_WRITE_AT_ONCE, cansend)`) rather than draining the
/// whole buffer regardless of the token balance. Pass `u64::MAX` when unthrottled.
pub fn transfer_block(state: &mut State, input_fd: RawFd, output_fd: RawFd, cansend: u64) -> Result<TransferOutcome> {
    let wanted = if state.control.target_buffer_size > 0 {
        state.control.target_buffer_size
    } else {
        state.transfer.buffer_size.max(BUFFER_SIZE)
    };
    ensure_buffer_size(&mut state.transfer, wanted.min(MAX_READ_AT_ONCE), state.control.target_buffer_size);

    let send_cap = if cansend >= MAX_WRITE_AT_ONCE as u64 {
        MAX_WRITE_AT_ONCE
    } else {
        cansend as usize
    };

    let read_len = {
        let transfer = &mut state.transfer;
        let skip_errors = state.control.skip_errors;
        let skip_block = state.control.error_skip_block;
        let limit = send_cap.min(transfer.buffer.len());
        read_once(input_fd, &mut transfer.buffer[..limit], &mut transfer.read_error_skip, skip_errors, skip_block)?
    };

    if read_len == 0 {
        return Ok(TransferOutcome::InputExhausted);
    }

    if state.control.discard_input {
        state.transfer.total_written += read_len as u64;
        state.transfer.transferred += read_len as u64;
        if state.control.linemode {
            let buf = state.transfer.buffer[..read_len].to_vec();
            record_lines(state, &buf);
        }
        return Ok(TransferOutcome::Continue);
    }

    {
        let slice = state.transfer.buffer[..read_len].to_vec();
        format::note_last_written(&mut state.display, &slice);
        write_all(output_fd, &slice)?;
        state.transfer.total_written += slice.len() as u64;
        state.transfer.transferred += slice.len() as u64;
        if state.control.linemode {
            record_lines(state, &slice);
        }
    }

    if state.control.sync_after_write {
        unsafe {
            libc::fsync(output_fd);
        }
    }

    if state.control.stop_at_size && state.control.size > 0 && state.transfer.total_written >= state.control.size {
        return Ok(TransferOutcome::InputExhausted);
    }

    Ok(TransferOutcome::Continue)
}

/// Opens input file `idx` from `control.input_files`, mirroring `pv_next_file`: `-` means
/// stdin, and any other path is rejected if it resolves to the same regular file or block
/// device as `output_fd`, to stop `pv a > a` from being accepted silently. Reapplies
/// `O_DIRECT` on the new fd when `--direct-io` is set, since the flag doesn't carry over a
/// fresh `open()`.
pub fn open_indexed_file(control: &Control, idx: usize, output_fd: RawFd) -> Result<(RawFd, Option<File>)> {
    let path = &control.input_files[idx];
    if path.to_str() == Some("-") {
        return Ok((libc::STDIN_FILENO, None));
    }

    let file = OpenOptions::new().read(true).open(path).map_err(|inner| Error::FileAccess { path: path.clone(), inner })?;
    let fd = file.as_raw_fd();

    let mut input_stat: libc::stat = unsafe { mem::zeroed() };
    let mut output_stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut input_stat) } != 0 || unsafe { libc::fstat(output_fd, &mut output_stat) } != 0 {
        return Err(Error::FileAccess { path: path.clone(), inner: io::Error::last_os_error() });
    }

    let is_tty = unsafe { libc::isatty(fd) != 0 };
    let is_reg_or_blk = matches!(input_stat.st_mode & libc::S_IFMT, libc::S_IFREG | libc::S_IFBLK);
    if !is_tty && is_reg_or_blk && input_stat.st_dev == output_stat.st_dev && input_stat.st_ino == output_stat.st_ino {
        return Err(Error::InputIsOutput { path: path.clone() });
    }

    if control.direct_io {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT);
        }
    }

    Ok((fd, Some(file)))
}

/// Advances to the next input file once the current one has hit EOF, mirroring the
/// "EOF, and files remain - advance to the next file" step of `pv_main_loop`. Returns `None`
/// once every listed input file (or the single implicit stdin, when none were given) has been
/// consumed, which tells the caller to stop.
pub fn advance_file(state: &mut State, output_fd: RawFd) -> Result<Option<(RawFd, Option<File>)>> {
    let next_idx = state.transfer.current_input_file + 1;
    if next_idx < 0 || next_idx as usize >= state.control.input_files.len() {
        return Ok(None);
    }

    let (fd, guard) = open_indexed_file(&state.control, next_idx as usize, output_fd)?;
    state.transfer.current_input_file = next_idx;
    state.transfer.read_error_skip = ReadErrorSkip { fd, ..Default::default() };
    Ok(Some((fd, guard)))
}

/// Pipe back-pressure accounting: how many bytes written to the downstream consumer are
/// still sitting unread in its pipe buffer (`FIONREAD` on the output fd, SPEC_FULL.md §4.4).
pub fn update_backpressure(state: &mut State, output_fd: RawFd) {
    if let Ok(pending) = fionread(output_fd) {
        state.transfer.written_but_not_consumed = pending;
    }
}

/// `pv_calc_total_bytes`: the byte size of a single input, used for pre-counting when
/// `--size` was not given explicitly. Returns `None` for non-seekable inputs (pipes).
pub fn calc_total_bytes(path: &Path) -> Result<Option<u64>> {
    let file = File::open(path).map_err(|inner| Error::FileAccess { path: path.to_path_buf(), inner })?;
    let meta = file.metadata().map_err(|inner| Error::FileAccess { path: path.to_path_buf(), inner })?;
    if meta.is_file() {
        return Ok(Some(meta.len()));
    }
    // Block devices report a zero regular-file length; ask the kernel for their actual size.
    if cfg!(target_os = "linux") {
        let mut size: libc::c_ulonglong = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), 0x80081272u64 as libc::c_ulong, &mut size) }; // BLKGETSIZE64
        if rc == 0 && size > 0 {
            return Ok(Some(size as u64));
        }
    }
    Ok(None)
}

/// `pv_calc_total_lines`: counts line terminators in a seekable input, leaving its file
/// position restored afterwards, used for `--line-mode --size`-less pre-counting.
pub fn calc_total_lines(path: &Path, null_terminated: bool) -> Result<u64> {
    use std::io::{BufReader, Read};
    let file = File::open(path).map_err(|inner| Error::FileAccess { path: path.to_path_buf(), inner })?;
    let terminator = if null_terminated { 0u8 } else { b'\n' };
    let mut reader = BufReader::new(file);
    let mut count = 0u64;
    let mut buf = [0u8; 65536];
    loop {
        let n = reader.read(&mut buf).map_err(|inner| Error::Read { inner })?;
        if n == 0 {
            break;
        }
        count += buf[..n].iter().filter(|&&b| b == terminator).count() as u64;
    }
    Ok(count)
}

/// Sums `calc_total_bytes` (or `calc_total_lines`) across every input file, for the implicit
/// `--size` pre-count pass described in SPEC_FULL.md §4.11. Returns `None` if any input isn't
/// seekable (e.g. a pipe is among the inputs), matching the original's all-or-nothing rule.
pub fn precount_total(paths: &[::std::path::PathBuf], linemode: bool, null_terminated: bool) -> Result<Option<u64>> {
    let mut total = 0u64;
    for path in paths {
        if linemode {
            total += calc_total_lines(path, null_terminated)?;
        } else {
            match calc_total_bytes(path)? {
                Some(n) => total += n,
                None => return Ok(None),
            }
        }
    }
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::{Control, State};
    use std::io::Write;

    fn new_state() -> State {
        State::new("pv", Control::default())
    }

    #[test]
    fn transfer_block_moves_bytes_between_pipes() {
        let mut state = new_state();
        let (r_in, w_in) = ::nix::unistd::pipe().unwrap();
        let (r_out, w_out) = ::nix::unistd::pipe().unwrap();
        unsafe {
            libc::write(w_in, b"hello\n".as_ptr() as *const libc::c_void, 6);
            libc::close(w_in);
        }
        let outcome = transfer_block(&mut state, r_in, w_out, u64::max_value()).unwrap();
        assert_eq!(outcome, TransferOutcome::Continue);
        assert_eq!(state.transfer.total_written, 6);

        let mut readback = [0u8; 16];
        let n = unsafe { libc::read(r_out, readback.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(&readback[..n as usize], b"hello\n");

        unsafe {
            libc::close(r_in);
            libc::close(r_out);
            libc::close(w_out);
        }
    }

    #[test]
    fn transfer_block_reports_eof() {
        let mut state = new_state();
        let (r_in, w_in) = ::nix::unistd::pipe().unwrap();
        let (r_out, w_out) = ::nix::unistd::pipe().unwrap();
        unsafe {
            libc::close(w_in);
        }
        let outcome = transfer_block(&mut state, r_in, w_out, u64::max_value()).unwrap();
        assert_eq!(outcome, TransferOutcome::InputExhausted);
        unsafe {
            libc::close(r_in);
            libc::close(r_out);
            libc::close(w_out);
        }
    }

    #[test]
    fn transfer_block_honours_cansend_budget() {
        let mut state = new_state();
        let (r_in, w_in) = ::nix::unistd::pipe().unwrap();
        let (r_out, w_out) = ::nix::unistd::pipe().unwrap();
        unsafe {
            libc::write(w_in, b"0123456789".as_ptr() as *const libc::c_void, 10);
            libc::close(w_in);
        }
        let outcome = transfer_block(&mut state, r_in, w_out, 4).unwrap();
        assert_eq!(outcome, TransferOutcome::Continue);
        assert_eq!(state.transfer.total_written, 4);

        let mut readback = [0u8; 16];
        let n = unsafe { libc::read(r_out, readback.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(&readback[..n as usize], b"0123");

        unsafe {
            libc::close(r_in);
            libc::close(r_out);
            libc::close(w_out);
        }
    }

    #[test]
    fn calc_total_bytes_reads_regular_file_length() {
        let mut tmp = ::std::env::temp_dir();
        tmp.push("pv_transfer_test_file");
        {
            let mut f = File::create(&tmp).unwrap();
            f.write_all(b"0123456789").unwrap();
        }
        let size = calc_total_bytes(&tmp).unwrap();
        assert_eq!(size, Some(10));
        let _ = ::std::fs::remove_file(&tmp);
    }

    #[test]
    fn calc_total_lines_counts_newlines() {
        let mut tmp = ::std::env::temp_dir();
        tmp.push("pv_transfer_test_lines");
        {
            let mut f = File::create(&tmp).unwrap();
            f.write_all(b"a\nb\nc\n").unwrap();
        }
        let count = calc_total_lines(&tmp, false).unwrap();
        assert_eq!(count, 3);
        let _ = ::std::fs::remove_file(&tmp);
    }

    #[test]
    fn advance_file_is_a_noop_without_a_file_list() {
        let mut state = new_state();
        let (_r_out, w_out) = ::nix::unistd::pipe().unwrap();
        assert_eq!(state.transfer.current_input_file, -1);
        let next = advance_file(&mut state, w_out).unwrap();
        assert!(next.is_none());
        unsafe {
            libc::close(w_out);
        }
    }

    #[test]
    fn advance_file_opens_each_listed_file_in_order() {
        let mut tmp_a = ::std::env::temp_dir();
        tmp_a.push("pv_transfer_test_advance_a");
        let mut tmp_b = ::std::env::temp_dir();
        tmp_b.push("pv_transfer_test_advance_b");
        File::create(&tmp_a).unwrap().write_all(b"aaa").unwrap();
        File::create(&tmp_b).unwrap().write_all(b"bbb").unwrap();

        let mut state = new_state();
        state.control.input_files = vec![tmp_a.clone(), tmp_b.clone()];
        let (_r_out, w_out) = ::nix::unistd::pipe().unwrap();

        let (fd_a, _guard_a) = advance_file(&mut state, w_out).unwrap().unwrap();
        assert_eq!(state.transfer.current_input_file, 0);
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fd_a, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(&buf[..n as usize], b"aaa");

        let (fd_b, _guard_b) = advance_file(&mut state, w_out).unwrap().unwrap();
        assert_eq!(state.transfer.current_input_file, 1);
        let n = unsafe { libc::read(fd_b, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(&buf[..n as usize], b"bbb");

        assert!(advance_file(&mut state, w_out).unwrap().is_none());

        unsafe {
            libc::close(w_out);
        }
        let _ = ::std::fs::remove_file(&tmp_a);
        let _ = ::std::fs::remove_file(&tmp_b);
    }

    #[test]
    fn open_indexed_file_rejects_input_that_is_also_the_output() {
        let mut tmp = ::std::env::temp_dir();
        tmp.push("pv_transfer_test_same_file");
        File::create(&tmp).unwrap().write_all(b"x").unwrap();

        let control = Control { input_files: vec![tmp.clone()], ..Control::default() };
        let output = File::create(&tmp).unwrap();
        let err = open_indexed_file(&control, 0, output.as_raw_fd()).unwrap_err();
        assert_eq!(err.exit_bit(), 4);

        let _ = ::std::fs::remove_file(&tmp);
    }
}
