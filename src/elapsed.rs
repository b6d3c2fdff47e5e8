//! Monotonic, suspend-excluding elapsed-time arithmetic (SPEC_FULL.md §4.1).
//!
//! Ported from `original_source/src/pv/elapsedtime.c`. `libc::timespec` stands in for the
//! C `struct timespec`; all arithmetic is done in nanoseconds to avoid floating point drift.

use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};
use std::io;

/// A point in monotonic time, or a duration, depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElapsedTime {
    pub sec: i64,
    pub nsec: i64,
}

impl ElapsedTime {
    pub fn zero() -> Self {
        ElapsedTime { sec: 0, nsec: 0 }
    }

    /// Reads the current monotonic time. Exits the process with status 16 on failure,
    /// mirroring `pv_elapsedtime_read`'s "the clock is a hard dependency" contract.
    pub fn read() -> Self {
        let mut ts = timespec { tv_sec: 0, tv_nsec: 0 };
        let rc = unsafe { clock_gettime(CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            eprintln!("pv: clock_gettime: {}", io::Error::last_os_error());
            ::std::process::exit(16);
        }
        ElapsedTime { sec: ts.tv_sec, nsec: ts.tv_nsec as i64 }
    }

    pub fn compare(&self, other: &ElapsedTime) -> i32 {
        if self.sec < other.sec {
            return -1;
        }
        if self.sec > other.sec {
            return 1;
        }
        if self.nsec < other.nsec {
            return -1;
        }
        if self.nsec > other.nsec {
            return 1;
        }
        0
    }

    pub fn add(&self, other: &ElapsedTime) -> ElapsedTime {
        normalize(self.sec + other.sec, self.nsec + other.nsec)
    }

    pub fn add_nsec(&self, add_nanoseconds: i64) -> ElapsedTime {
        normalize(self.sec, self.nsec + add_nanoseconds)
    }

    pub fn subtract(&self, other: &ElapsedTime) -> ElapsedTime {
        let mut sec = self.sec - other.sec;
        let mut nsec = self.nsec - other.nsec;
        if nsec < 0 {
            sec -= 1;
            nsec += 1_000_000_000;
        }
        ElapsedTime { sec, nsec }
    }

    pub fn seconds(&self) -> f64 {
        self.sec as f64 + (self.nsec as f64) / 1_000_000_000.0
    }
}

fn normalize(mut sec: i64, mut nsec: i64) -> ElapsedTime {
    sec += nsec.div_euclid(1_000_000_000);
    nsec = nsec.rem_euclid(1_000_000_000);
    ElapsedTime { sec, nsec }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_orders_by_seconds_then_nanoseconds() {
        let a = ElapsedTime { sec: 1, nsec: 0 };
        let b = ElapsedTime { sec: 1, nsec: 500 };
        let c = ElapsedTime { sec: 2, nsec: 0 };
        assert_eq!(a.compare(&b), -1);
        assert_eq!(b.compare(&a), 1);
        assert_eq!(a.compare(&c), -1);
        assert_eq!(a.compare(&a), 0);
    }

    #[test]
    fn add_carries_nanoseconds_into_seconds() {
        let a = ElapsedTime { sec: 1, nsec: 700_000_000 };
        let b = ElapsedTime { sec: 0, nsec: 400_000_000 };
        let sum = a.add(&b);
        assert_eq!(sum.sec, 2);
        assert_eq!(sum.nsec, 100_000_000);
    }

    #[test]
    fn subtract_borrows_when_nanoseconds_go_negative() {
        let a = ElapsedTime { sec: 5, nsec: 100 };
        let b = ElapsedTime { sec: 2, nsec: 500 };
        let diff = a.subtract(&b);
        assert_eq!(diff.sec, 2);
        assert_eq!(diff.nsec, 999_999_600);
    }

    #[test]
    fn seconds_converts_to_floating_point() {
        let t = ElapsedTime { sec: 3, nsec: 500_000_000 };
        assert!((t.seconds() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn add_nsec_wraps_correctly() {
        let t = ElapsedTime { sec: 1, nsec: 900_000_000 };
        let added = t.add_nsec(200_000_000);
        assert_eq!(added.sec, 2);
        assert_eq!(added.nsec, 100_000_000);
    }
}
