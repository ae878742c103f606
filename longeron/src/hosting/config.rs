//! Plugin discovery port and configuration.
//!
//! Recognized JSON options under `plugins`: `path` (bundle directory,
//! default `./plugins`) and `hot_reload`. How bundles are located and
//! instantiated is behind the [`PluginDiscovery`] port; on-disk packaging
//! is out of scope here.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use longeron_core::{CoreError, Result};

use super::plugin::ServicePlugin;

/// JSON namespace key this block is read from.
pub const CONFIG_NAMESPACE: &str = "plugins";

fn default_plugin_path() -> PathBuf {
    PathBuf::from("./plugins")
}

/// Parsed plugin configuration block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    /// Directory containing plugin bundles.
    #[serde(default = "default_plugin_path")]
    pub path: PathBuf,

    /// Allow loaders to reload a plugin in place on disk change.
    #[serde(default)]
    pub hot_reload: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            path: default_plugin_path(),
            hot_reload: false,
        }
    }
}

impl PluginConfig {
    /// Read the configuration block out of a JSON document root.
    ///
    /// A missing block yields the defaults.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the block is present but malformed.
    pub fn from_json_root(root: &serde_json::Value) -> Result<Self> {
        match root.get(CONFIG_NAMESPACE) {
            None => Ok(Self::default()),
            Some(block) => serde_json::from_value(block.clone()).map_err(|e| {
                warn!("[PluginConfig] Malformed '{CONFIG_NAMESPACE}' block: {e}");
                CoreError::InvalidArgument("malformed plugins configuration block")
            }),
        }
    }
}

/// Port over plugin location and instantiation.
///
/// Implementations map a configured directory to live plugin instances;
/// the stack never touches loading mechanics itself.
pub trait PluginDiscovery: Send + Sync {
    /// Produce the plugins available under `config`.
    ///
    /// # Errors
    ///
    /// A discovery failure aborts the batch; individual plugin load
    /// failures are handled (and skipped) by the manager instead.
    fn discover(&self, config: &PluginConfig) -> Result<Vec<Arc<dyn ServicePlugin>>>;
}
