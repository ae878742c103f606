//! Service stack.
//!
//! Composes the service groups, their servers and the plugin manager into
//! one lifecycle: `configured → running → stopping → stopped`. Starting
//! links a cancellation token under the caller's; a wait-for-all task
//! observes every server exit and then tears down plugins and hosts
//! exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use longeron_core::cancel::CancelToken;
use longeron_core::{CoreError, Result};

use super::group::{ServiceGroup, ServiceHost};
use super::plugin::PluginManager;

/// Lifecycle states of a [`ServiceStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// Built, not yet started.
    Configured,
    /// Servers running.
    Running,
    /// Stop requested, servers draining.
    Stopping,
    /// Every server exited and teardown ran.
    Stopped,
}

/// One server driving the connections of one service group.
///
/// The HTTP server itself is out of scope here; implementations bridge a
/// listener node (or anything else) to the group's hosts and return when
/// the token cancels.
#[async_trait(?Send)]
pub trait GroupServer {
    /// The group this server belongs to.
    fn group(&self) -> Arc<ServiceGroup>;

    /// Run until cancelled.
    async fn run(self: Box<Self>, cancel: CancelToken);
}

struct StackInner {
    state: Mutex<StackState>,
    groups: Vec<Arc<ServiceGroup>>,
    plugins: Arc<PluginManager>,
    cancel: Mutex<Option<CancelToken>>,
    exit_task: Mutex<Option<compio::runtime::Task<()>>>,
    torn_down: AtomicBool,
}

impl StackInner {
    /// Runs after the last server exits; exactly once per stack.
    fn on_all_server_exit(&self) {
        if !self.torn_down.swap(true, Ordering::AcqRel) {
            debug!("[ServiceStack] All servers exited, tearing down");
            self.plugins.unload_all();
            for group in &self.groups {
                group.teardown();
            }
        }
        *self.state.lock() = StackState::Stopped;
    }
}

/// The composed service stack.
pub struct ServiceStack {
    inner: Arc<StackInner>,
    servers: Mutex<Vec<Box<dyn GroupServer>>>,
}

impl ServiceStack {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StackState {
        *self.inner.state.lock()
    }

    /// The stack's plugin manager.
    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.inner.plugins
    }

    /// The service groups, keyed at build time by transport endpoint.
    #[must_use]
    pub fn groups(&self) -> &[Arc<ServiceGroup>] {
        &self.inner.groups
    }

    /// Start every group server.
    ///
    /// The servers run under a token linked to `parent_cancel` (when
    /// given), so cancelling the parent stops the stack too.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the stack is still `Configured`.
    pub fn start_servers(&self, parent_cancel: Option<&CancelToken>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != StackState::Configured {
                return Err(CoreError::InvalidState("stack has already been started"));
            }
            *state = StackState::Running;
        }

        let token = parent_cancel.map_or_else(CancelToken::new, CancelToken::child);
        let servers: Vec<_> = self.servers.lock().drain(..).collect();
        debug!("[ServiceStack] Starting {} group servers", servers.len());

        let mut tasks = Vec::with_capacity(servers.len());
        for server in servers {
            tasks.push(compio::runtime::spawn(server.run(token.child())));
        }
        *self.inner.cancel.lock() = Some(token);

        let inner = self.inner.clone();
        let exit_task = compio::runtime::spawn(async move {
            for task in tasks {
                task.await;
            }
            inner.on_all_server_exit();
        });
        *self.inner.exit_task.lock() = Some(exit_task);
        Ok(())
    }

    /// Cancel the linked token and wait until teardown completes.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the stack is `Running`.
    pub async fn stop_and_wait(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != StackState::Running {
                return Err(CoreError::InvalidState("stack is not running"));
            }
            *state = StackState::Stopping;
        }
        if let Some(token) = self.inner.cancel.lock().as_ref() {
            token.cancel();
        }
        let task = self
            .inner
            .exit_task
            .lock()
            .take()
            .ok_or(CoreError::InvalidState("stack exit task already awaited"))?;
        task.await;
        Ok(())
    }
}

/// Builder binding virtual hosts into groups and servers into a stack.
pub struct ServiceStackBuilder {
    hosts: Vec<Arc<dyn ServiceHost>>,
}

impl Default for ServiceStackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStackBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self { hosts: Vec::new() }
    }

    /// Add one virtual host.
    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn ServiceHost>) -> Self {
        self.hosts.push(host);
        self
    }

    /// Add a batch of virtual hosts.
    #[must_use]
    pub fn with_hosts(mut self, hosts: impl IntoIterator<Item = Arc<dyn ServiceHost>>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    /// Group the hosts by transport endpoint and build one server per
    /// group through `server_factory`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` from group construction (duplicate host names).
    pub fn build(
        self,
        server_factory: impl Fn(Arc<ServiceGroup>) -> Box<dyn GroupServer>,
    ) -> Result<ServiceStack> {
        let mut by_transport: HashMap<SocketAddr, Vec<Arc<dyn ServiceHost>>> = HashMap::new();
        for host in self.hosts {
            by_transport.entry(host.transport()).or_default().push(host);
        }
        if by_transport.is_empty() {
            warn!("[ServiceStack] Building a stack with no virtual hosts");
        }

        let mut groups = Vec::with_capacity(by_transport.len());
        let mut servers = Vec::with_capacity(by_transport.len());
        for (transport, hosts) in by_transport {
            let group = Arc::new(ServiceGroup::new(transport, hosts)?);
            servers.push(server_factory(group.clone()));
            groups.push(group);
        }

        Ok(ServiceStack {
            inner: Arc::new(StackInner {
                state: Mutex::new(StackState::Configured),
                plugins: Arc::new(PluginManager::new(groups.clone())),
                groups,
                cancel: Mutex::new(None),
                exit_task: Mutex::new(None),
                torn_down: AtomicBool::new(false),
            }),
            servers: Mutex::new(servers),
        })
    }
}
