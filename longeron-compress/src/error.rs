//! Compression bridge error types.

use longeron_core::ErrorKind;
use thiserror::Error;

/// Error type for the native compression bridge.
#[derive(Error, Debug)]
pub enum CompressionError {
    /// Malformed caller input
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation attempted on uninitialized or mismatched state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Native or host allocation failed
    #[error("out of memory")]
    OutOfMemory,

    /// Method or level rejected by the loaded library
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Integer overflow while sizing an operation
    #[error("integer overflow: {0}")]
    Overflow(&'static str),

    /// Corruption reported by the native library; no recovery
    #[error("compression state corrupted: {0}")]
    Corrupted(&'static str),

    /// Negative status outside the documented table
    #[error("unrecognized native status {code} from {context}")]
    Unrecognized {
        /// Raw status returned by the native call
        code: i64,
        /// Exported function that produced it
        context: &'static str,
    },

    /// Shared library could not be loaded or a symbol is missing
    #[error("native library error: {0}")]
    Load(#[from] libloading::Error),

    /// Malformed configuration block
    #[error("bad compression configuration: {0}")]
    Config(String),
}

/// Result type alias for compression-bridge operations.
pub type Result<T> = std::result::Result<T, CompressionError>;

impl CompressionError {
    /// Classify this error into the stack-wide taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::Config(_) => ErrorKind::InvalidArgument,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::OutOfMemory => ErrorKind::OutOfMemory,
            Self::NotSupported(_) | Self::Load(_) => ErrorKind::NotSupported,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Corrupted(_) | Self::Unrecognized { .. } => ErrorKind::Corrupted,
        }
    }
}
