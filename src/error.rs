use std::path::PathBuf;

use failure;
use nix;

pub type Result<T> = ::std::result::Result<T, Error>;

/// One variant per exit-status bit in the CLI surface (SPEC_FULL.md §6).
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "{}: {}", path, inner)]
    FileAccess { path: PathBuf, inner: ::std::io::Error },

    #[fail(display = "read error: {}", inner)]
    Read { inner: ::std::io::Error },

    #[fail(display = "write error: {}", inner)]
    Write { inner: ::std::io::Error },

    #[fail(display = "input file is output file: {}", path)]
    InputIsOutput { path: PathBuf },

    #[fail(display = "failed to open or close file: {}", inner)]
    FileOpenClose { inner: ::std::io::Error },

    #[fail(display = "clock_gettime failed: {}", inner)]
    ClockRead { inner: nix::Error },

    #[fail(display = "memory allocation failed")]
    Alloc,

    #[fail(display = "aborted by signal")]
    SignalAborted,

    #[fail(display = "{}", message)]
    OptionValidation { message: String },

    #[fail(display = "{}", inner)]
    Misc { inner: failure::Error },
}

impl Error {
    /// The bit this error contributes to the process exit status (SPEC_FULL.md §6).
    pub fn exit_bit(&self) -> u8 {
        match *self {
            Error::FileAccess { .. } => 2,
            Error::Read { .. } => 2,
            Error::Write { .. } => 2,
            Error::InputIsOutput { .. } => 4,
            Error::FileOpenClose { .. } => 8,
            Error::ClockRead { .. } => 16,
            Error::Alloc => 64,
            Error::SignalAborted => 32,
            Error::OptionValidation { .. } => 2,
            Error::Misc { .. } => 2,
        }
    }
}

impl From<failure::Error> for Error {
    fn from(inner: failure::Error) -> Self {
        Error::Misc { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::ClockRead { inner }
    }
}
