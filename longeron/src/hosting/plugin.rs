//! Plugin lifecycle and the plugin manager.
//!
//! Plugins publish named services through an explicit
//! [`ServicePlugin::publish_services`] entry point into a type-keyed pool;
//! there is no runtime discovery of configurator methods. The manager owns
//! the event channel plugins feed (the back-edge is message passing, never
//! a listener reference from plugin to manager), fans load/unload out to
//! every service group, and dispatches textual commands by plugin name.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use longeron_core::{CoreError, Result};

use super::group::{ServiceEndpoint, ServiceGroup};

/// Type-keyed pool of services a plugin publishes while loaded.
#[derive(Default)]
pub struct ServicePool {
    services: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ServicePool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a service instance under its type tag, replacing any
    /// previous instance of the same type.
    pub fn publish<T: Any + Send + Sync>(&mut self, service: T) {
        self.services.insert(TypeId::of::<T>(), Box::new(service));
    }

    /// Look up a published service by type.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    /// Number of published services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether nothing is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// A hostable plugin.
pub trait ServicePlugin: Send + Sync {
    /// Plugin name used for command routing.
    fn name(&self) -> &str;

    /// Publish this plugin's services into the pool. Called on load;
    /// an error excludes the plugin from the loaded set.
    ///
    /// # Errors
    ///
    /// Any error aborts the load of this plugin only.
    fn publish_services(&self, services: &mut ServicePool) -> Result<()>;

    /// Endpoints this plugin exposes for host attachment.
    fn endpoints(&self) -> Vec<ServiceEndpoint>;

    /// Handle a textual command; `true` means the command was accepted.
    fn handle_command(&self, _command: &str) -> bool {
        false
    }
}

/// Name comparison used by command dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseCompare {
    /// Exact byte comparison.
    Ordinal,
    /// ASCII case-insensitive comparison.
    OrdinalIgnoreCase,
}

impl CaseCompare {
    fn matches(self, a: &str, b: &str) -> bool {
        match self {
            Self::Ordinal => a == b,
            Self::OrdinalIgnoreCase => a.eq_ignore_ascii_case(b),
        }
    }
}

/// Lifecycle events emitted on the manager's channel.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    /// A plugin loaded and its endpoints were attached.
    Loaded {
        /// Plugin name.
        plugin: String,
    },
    /// A plugin was unloaded and its endpoints detached.
    Unloaded {
        /// Plugin name.
        plugin: String,
    },
    /// A plugin failed to load and was excluded.
    LoadFailed {
        /// Plugin name.
        plugin: String,
    },
}

/// Lifecycle wrapper around one plugin instance.
///
/// The service pool is `Some` only between a successful load and the next
/// unload; the internal lock serializes lifecycle transitions per plugin
/// while distinct plugins proceed independently.
pub struct ManagedPlugin {
    id: u64,
    plugin: Arc<dyn ServicePlugin>,
    services: Mutex<Option<ServicePool>>,
}

impl ManagedPlugin {
    fn new(id: u64, plugin: Arc<dyn ServicePlugin>) -> Self {
        Self {
            id,
            plugin,
            services: Mutex::new(None),
        }
    }

    /// Identity key used by service groups.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    /// The wrapped plugin instance.
    #[must_use]
    pub fn plugin(&self) -> &Arc<dyn ServicePlugin> {
        &self.plugin
    }

    /// Whether the plugin currently holds a service pool.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.services.lock().is_some()
    }

    /// Run `f` against the published services, if loaded.
    pub fn with_services<R>(&self, f: impl FnOnce(&ServicePool) -> R) -> Option<R> {
        self.services.lock().as_ref().map(f)
    }

    /// Offer a command to this plugin; rejected when not loaded.
    #[must_use]
    pub fn send_command(&self, command: &str) -> bool {
        self.is_loaded() && self.plugin.handle_command(command)
    }

    fn on_loaded(&self) -> Result<()> {
        let mut guard = self.services.lock();
        if guard.is_some() {
            return Err(CoreError::InvalidState("plugin is already loaded"));
        }
        let mut pool = ServicePool::new();
        self.plugin.publish_services(&mut pool)?;
        *guard = Some(pool);
        Ok(())
    }

    fn on_unloaded(&self) {
        // Dropping the pool disposes every published service.
        drop(self.services.lock().take());
    }
}

/// Loads, unloads and addresses plugins on behalf of the service stack.
pub struct PluginManager {
    groups: Vec<Arc<ServiceGroup>>,
    plugins: RwLock<Vec<Arc<ManagedPlugin>>>,
    next_id: AtomicU64,
    events_tx: flume::Sender<PluginEvent>,
    events_rx: flume::Receiver<PluginEvent>,
}

impl PluginManager {
    /// Create a manager fanning plugin events out to `groups`.
    #[must_use]
    pub fn new(groups: Vec<Arc<ServiceGroup>>) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            groups,
            plugins: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events_tx,
            events_rx,
        }
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn monitor(&self) -> flume::Receiver<PluginEvent> {
        self.events_rx.clone()
    }

    /// Number of currently loaded plugins.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.plugins.read().len()
    }

    /// Look up a loaded plugin by exact name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<ManagedPlugin>> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Load one plugin: populate its service pool, then attach its
    /// endpoints to every service group.
    ///
    /// # Errors
    ///
    /// The load failure; the plugin is excluded and the stack continues.
    pub fn load_plugin(&self, plugin: Arc<dyn ServicePlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let managed = Arc::new(ManagedPlugin::new(id, plugin));

        if let Err(e) = managed.on_loaded() {
            warn!("[PluginManager] Plugin '{name}' failed to load: {e}");
            let _ = self.events_tx.send(PluginEvent::LoadFailed { plugin: name });
            return Err(e);
        }

        let endpoints = managed.plugin().endpoints();
        for group in &self.groups {
            group.attach_plugin(id, endpoints.clone());
        }
        self.plugins.write().push(managed);
        debug!("[PluginManager] Plugin '{name}' loaded with {} endpoints", endpoints.len());
        let _ = self.events_tx.send(PluginEvent::Loaded { plugin: name });
        Ok(())
    }

    /// Unload one plugin by exact name: detach the recorded endpoint sets,
    /// then dispose its service pool.
    ///
    /// # Errors
    ///
    /// `InvalidState` when no such plugin is loaded.
    pub fn unload_plugin(&self, name: &str) -> Result<()> {
        let managed = {
            let mut plugins = self.plugins.write();
            let index = plugins
                .iter()
                .position(|p| p.name() == name)
                .ok_or(CoreError::InvalidState("plugin is not loaded"))?;
            plugins.remove(index)
        };
        self.unload(&managed);
        Ok(())
    }

    /// Unload every plugin in load order.
    pub fn unload_all(&self) {
        let drained: Vec<_> = self.plugins.write().drain(..).collect();
        for managed in drained {
            self.unload(&managed);
        }
    }

    fn unload(&self, managed: &ManagedPlugin) {
        for group in &self.groups {
            group.detach_plugin(managed.id());
        }
        managed.on_unloaded();
        debug!("[PluginManager] Plugin '{}' unloaded", managed.name());
        let _ = self.events_tx.send(PluginEvent::Unloaded {
            plugin: managed.name().to_string(),
        });
    }

    /// Load everything a discovery port yields, skipping plugins that
    /// fail to load. Returns the number actually loaded.
    ///
    /// # Errors
    ///
    /// Propagates only a discovery failure; per-plugin failures are
    /// logged and skipped.
    pub fn load_from(
        &self,
        discovery: &dyn super::config::PluginDiscovery,
        config: &super::config::PluginConfig,
    ) -> Result<usize> {
        let mut loaded = 0;
        for plugin in discovery.discover(config)? {
            if self.load_plugin(plugin).is_ok() {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Walk loaded plugins and hand `command` to the first whose name
    /// matches under `compare` and whose handler accepts it.
    #[must_use]
    pub fn send_command_to_plugin(
        &self,
        name: &str,
        command: &str,
        compare: CaseCompare,
    ) -> bool {
        let plugins = self.plugins.read().clone();
        for plugin in plugins {
            if compare.matches(plugin.name(), name) && plugin.send_command(command) {
                return true;
            }
        }
        false
    }
}
