//! Service groups and hosts.
//!
//! A service group is the set of virtual hosts sharing one transport
//! endpoint; one server runs per group. The group also owns the record of
//! which endpoints each plugin attached, so an unload detaches exactly
//! what the load attached.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::debug;

use longeron_core::{CoreError, Result};

/// A routable unit exposed by a plugin and attached to hosts at load time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    /// Route the endpoint is published under.
    pub path: String,
}

impl ServiceEndpoint {
    /// Create an endpoint for `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// A processor bound to a transport endpoint, receiving endpoint
/// attach/detach callbacks as plugins come and go.
///
/// Attach and detach may be invoked concurrently for distinct plugins;
/// implementations must tolerate that.
pub trait ServiceHost: Send + Sync {
    /// Host name, unique within its service group.
    fn name(&self) -> &str;

    /// Transport endpoint this host serves.
    fn transport(&self) -> SocketAddr;

    /// A loaded plugin exposed `endpoints`.
    fn on_service_attach(&self, endpoints: &[ServiceEndpoint]);

    /// A plugin is unloading; `endpoints` is exactly the set attached.
    fn on_service_detach(&self, endpoints: &[ServiceEndpoint]);

    /// The owning stack is tearing down.
    fn on_teardown(&self) {}
}

type EndpointSet = SmallVec<[ServiceEndpoint; 4]>;

/// Virtual hosts sharing one transport endpoint.
pub struct ServiceGroup {
    transport: SocketAddr,
    hosts: Vec<Arc<dyn ServiceHost>>,
    /// Plugin identity → endpoints that plugin attached here.
    attached: DashMap<u64, EndpointSet>,
}

impl ServiceGroup {
    /// Build a group from hosts that all serve `transport`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a duplicate host name or a transport mismatch.
    pub fn new(transport: SocketAddr, hosts: Vec<Arc<dyn ServiceHost>>) -> Result<Self> {
        for (i, host) in hosts.iter().enumerate() {
            if host.transport() != transport {
                return Err(CoreError::InvalidArgument(
                    "host transport does not match its group",
                ));
            }
            if hosts[..i].iter().any(|h| h.name() == host.name()) {
                return Err(CoreError::InvalidArgument(
                    "host names must be unique within a service group",
                ));
            }
        }
        Ok(Self {
            transport,
            hosts,
            attached: DashMap::new(),
        })
    }

    /// Transport endpoint shared by every host in this group.
    #[must_use]
    pub const fn transport(&self) -> SocketAddr {
        self.transport
    }

    /// Hosts composing this group.
    #[must_use]
    pub fn hosts(&self) -> &[Arc<dyn ServiceHost>] {
        &self.hosts
    }

    /// Number of plugins currently holding attachments here.
    #[must_use]
    pub fn attached_plugins(&self) -> usize {
        self.attached.len()
    }

    /// Record `endpoints` for the plugin and notify every host.
    pub(crate) fn attach_plugin(&self, plugin_id: u64, endpoints: Vec<ServiceEndpoint>) {
        let set: EndpointSet = endpoints.into_iter().collect();
        for host in &self.hosts {
            host.on_service_attach(&set);
        }
        self.attached.insert(plugin_id, set);
        debug!(
            "[ServiceGroup] Plugin {plugin_id} attached on {}",
            self.transport
        );
    }

    /// Reverse exactly what [`attach_plugin`](Self::attach_plugin) did.
    pub(crate) fn detach_plugin(&self, plugin_id: u64) {
        if let Some((_, set)) = self.attached.remove(&plugin_id) {
            for host in &self.hosts {
                host.on_service_detach(&set);
            }
            debug!(
                "[ServiceGroup] Plugin {plugin_id} detached from {}",
                self.transport
            );
        }
    }

    /// Stack teardown: notify hosts once.
    pub(crate) fn teardown(&self) {
        for host in &self.hosts {
            host.on_teardown();
        }
    }
}

impl std::fmt::Debug for ServiceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGroup")
            .field("transport", &self.transport)
            .field("hosts", &self.hosts.len())
            .field("attached_plugins", &self.attached.len())
            .finish()
    }
}
