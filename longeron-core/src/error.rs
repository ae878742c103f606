//! Longeron error types
//!
//! One error enum covers the transport core. Every variant corresponds to a
//! failure class callers are expected to branch on, so the enum carries a
//! stable [`ErrorKind`] alongside the human-readable message.

use std::io;
use thiserror::Error;

/// Coarse classification of a [`CoreError`].
///
/// Stable across releases; match on this rather than on variant payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input (null buffer with non-zero length, bad option value).
    InvalidArgument,
    /// Operation attempted against uninitialized or already-closed state.
    InvalidState,
    /// Host or native allocation failed.
    OutOfMemory,
    /// The operation is not supported on this platform or configuration.
    NotSupported,
    /// Integer overflow while sizing an operation.
    Overflow,
    /// Underlying state corruption with no recovery path.
    Corrupted,
    /// A pending I/O operation hit its per-direction timer.
    Timeout,
    /// Cooperative cancellation was observed.
    Canceled,
    /// Socket failure, carrying the underlying OS error.
    Io,
}

/// Main error type for the transport core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed caller input
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation attempted on uninitialized or closed state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Allocation failure
    #[error("out of memory")]
    OutOfMemory,

    /// Unsupported operation
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Integer overflow while sizing an operation
    #[error("integer overflow: {0}")]
    Overflow(&'static str),

    /// Unrecoverable state corruption
    #[error("state corrupted: {0}")]
    Corrupted(&'static str),

    /// Per-direction timer fired on a pending operation
    #[error("operation timed out")]
    Timeout,

    /// Cooperative cancellation
    #[error("operation canceled")]
    Canceled,

    /// Socket error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for transport-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::OutOfMemory => ErrorKind::OutOfMemory,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Corrupted(_) => ErrorKind::Corrupted,
            Self::Timeout => ErrorKind::Timeout,
            Self::Canceled => ErrorKind::Canceled,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Check whether this error is a pipeline timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check whether this error is a cooperative cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Check whether this error means the peer or pipe is gone for good.
    ///
    /// Timeouts are explicitly excluded: a timed-out direction remains
    /// usable and the caller decides whether to retry or tear down.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Timeout => false,
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => true,
        }
    }

    /// Duplicate this error for fan-out to a second observer.
    ///
    /// `io::Error` is not `Clone`; the copy keeps the kind and message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(m),
            Self::InvalidState(m) => Self::InvalidState(m),
            Self::OutOfMemory => Self::OutOfMemory,
            Self::NotSupported(m) => Self::NotSupported(m),
            Self::Overflow(m) => Self::Overflow(m),
            Self::Corrupted(m) => Self::Corrupted(m),
            Self::Timeout => Self::Timeout,
            Self::Canceled => Self::Canceled,
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(CoreError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(CoreError::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(
            CoreError::InvalidState("closed").kind(),
            ErrorKind::InvalidState
        );
        let io_err = CoreError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(io_err.kind(), ErrorKind::Io);
    }

    #[test]
    fn timeout_is_not_terminal() {
        assert!(!CoreError::Timeout.is_terminal());
        assert!(CoreError::Canceled.is_terminal());
        assert!(CoreError::Corrupted("native").is_terminal());
    }

    #[test]
    fn duplicate_preserves_io_kind() {
        let original = CoreError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let copy = original.duplicate();
        match copy {
            CoreError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected duplicate: {other:?}"),
        }
    }
}
