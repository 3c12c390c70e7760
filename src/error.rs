//! Crate-wide error type for libjournal
//!
//! Follows the same composition pattern this crate grew out of: each
//! component (`journal`, `lock`, `recovery`) gets its own `thiserror`-derived
//! error enum, and each converts into the single top-level [`Error`] that
//! every public operation returns.

use std::io;
use thiserror::Error;

use crate::journal::JournalError;
use crate::lock::LockError;
use crate::recovery::RecoveryError;

/// Coarse classification of an error, independent of which layer raised it.
///
/// Mirrors the classification the platform layer (§4.1) requires of every
/// underlying I/O failure: transient-io, no-space, permission, not-found,
/// invalid-argument, interrupted, other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad offsets, a closed handle, or a state-machine misuse.
    InvalidArgument,
    /// Missing data file or journal directory when one was required.
    NotFound,
    /// Journal directory already exists with incompatible contents.
    Exists,
    /// Underlying OS denied the operation.
    Permission,
    /// Underlying device or filesystem is out of space.
    NoSpace,
    /// Generic I/O failure not covered by a more specific kind.
    Io,
    /// A journal record failed its structural or checksum validation.
    CorruptJournal,
    /// `close` was called while autosync is still active.
    Busy,
    /// A blocking call was interrupted and the caller opted out of retry.
    Interrupted,
    /// Anything else.
    Other,
}

/// The crate-wide error type returned by every fallible public operation.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad offsets, a closed handle, or an operation attempted in the wrong
    /// transaction state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The data file or journal directory was missing when required.
    #[error("not found: {0}")]
    NotFound(String),

    /// The journal directory already exists with contents that do not look
    /// like a libjournal journal directory.
    #[error("journal directory already exists with incompatible contents: {0}")]
    Exists(String),

    /// Permission was denied by the OS.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The underlying device is out of space.
    #[error("no space left on device")]
    NoSpace,

    /// A generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `fsck` found a journal record that does not validate.
    #[error("corrupt journal record: {0}")]
    CorruptJournal(String),

    /// `close` was called with autosync still running.
    #[error("handle is busy: autosync is still active")]
    Busy,

    /// A blocking call was interrupted and the caller disabled internal
    /// EINTR retry.
    #[error("operation interrupted")]
    Interrupted,

    /// Lock manager failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Journal storage failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Recovery (fsck) failure.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl Error {
    /// Classify this error into one of the coarse kinds callers can match
    /// on without depending on a specific variant's payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Exists(_) => ErrorKind::Exists,
            Error::Permission(_) => ErrorKind::Permission,
            Error::NoSpace => ErrorKind::NoSpace,
            Error::Io(e) => classify_io_error(e),
            Error::CorruptJournal(_) => ErrorKind::CorruptJournal,
            Error::Busy => ErrorKind::Busy,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::Lock(_) => ErrorKind::Io,
            Error::Journal(e) => e.kind(),
            Error::Recovery(_) => ErrorKind::CorruptJournal,
        }
    }
}

/// Classify a raw `io::Error` the way the platform layer (§4.1) requires.
pub fn classify_io_error(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        io::ErrorKind::AlreadyExists => ErrorKind::Exists,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::InvalidArgument,
        io::ErrorKind::Interrupted => ErrorKind::Interrupted,
        _ => {
            if let Some(errno) = e.raw_os_error() {
                if errno == libc::ENOSPC {
                    return ErrorKind::NoSpace;
                }
            }
            ErrorKind::Other
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
