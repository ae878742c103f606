//! Longeron Compress
//!
//! Bridge between the service stack's streaming-compression interface and
//! the native compression shared library:
//! - Bit-exact ABI and status translation (`ffi`)
//! - Library discovery and the backend seam (`native`)
//! - Versioned compressor lifecycle (`manager`)
//! - Recognized JSON configuration (`config`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod ffi;
pub mod manager;
pub mod native;

pub use config::CompressionConfig;
pub use error::{CompressionError, Result};
pub use ffi::CompressionOperation;
pub use manager::{CompressionResult, Compressor, CompressorManager};
pub use native::{
    CompressionBackend, CompressionLevel, CompressionMethod, MethodSet, NativeLibrary,
};
