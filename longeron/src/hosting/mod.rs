//! Service hosting: stacks, groups, hosts and plugins.
//!
//! Control flow on plugin events:
//! 1. The manager loads a plugin; its service pool is populated through
//!    the explicit publish entry point.
//! 2. The event fans out to every service group, which records the
//!    plugin's endpoints and notifies each host's attach callback.
//! 3. Unload reverses the recorded attachment exactly, then disposes the
//!    service pool.

pub mod config;
pub mod group;
pub mod plugin;
pub mod stack;

pub use config::{PluginConfig, PluginDiscovery};
pub use group::{ServiceEndpoint, ServiceGroup, ServiceHost};
pub use plugin::{
    CaseCompare, ManagedPlugin, PluginEvent, PluginManager, ServicePlugin, ServicePool,
};
pub use stack::{GroupServer, ServiceStack, ServiceStackBuilder, StackState};
