//! Compression configuration.
//!
//! Recognized JSON options under the `vnlib.net.compression` namespace:
//! `level` (integer compression level, default fastest) and `lib_path`
//! (optional explicit shared-library path).

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CompressionError, Result};
use crate::native::CompressionLevel;

/// JSON namespace key this block is read from.
pub const CONFIG_NAMESPACE: &str = "vnlib.net.compression";

/// Parsed compression configuration block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    /// Compression level applied when compressors are initialized.
    #[serde(default)]
    pub level: CompressionLevel,

    /// Explicit shared-library path; when absent, discovery falls back to
    /// the environment variable and then the default library name.
    #[serde(default)]
    pub lib_path: Option<PathBuf>,
}

impl CompressionConfig {
    /// Read the configuration block out of a JSON document root.
    ///
    /// A missing block yields the defaults.
    ///
    /// # Errors
    ///
    /// `Config` when the block is present but malformed.
    pub fn from_json_root(root: &serde_json::Value) -> Result<Self> {
        match root.get(CONFIG_NAMESPACE) {
            None => Ok(Self::default()),
            Some(block) => serde_json::from_value(block.clone())
                .map_err(|e| CompressionError::Config(e.to_string())),
        }
    }
}
