//! Listener node configuration
//!
//! The exhaustive recognized option set for a TCP listener node, with
//! builder-style setters and validation. Defaults are tuned for a general
//! request/response workload.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::pool::BufferPool;

/// Hook invoked on the freshly tuned listening socket for OS-specific
/// options the node does not model itself.
pub type SocketCreatedHook = Arc<dyn Fn(&socket2::Socket) + Send + Sync>;

/// Configuration for a [`TcpServer`](crate::listener::TcpServer).
///
/// # Examples
///
/// ```
/// use longeron_core::config::TcpConfig;
///
/// let config = TcpConfig::new("127.0.0.1:0".parse().unwrap())
///     .with_accept_threads(2)
///     .with_max_connections(1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct TcpConfig {
    /// Address and port the listening socket binds to.
    pub local_endpoint: SocketAddr,

    /// Backlog passed to `listen(2)`.
    pub backlog: u32,

    /// Number of concurrent accept workers. Must be at least 1; a
    /// diagnostic is emitted when it exceeds the logical processor count.
    pub accept_threads: usize,

    /// Pause-writer threshold of the receive pipe, in bytes. Must be at
    /// least 4096.
    pub max_recv_buffer_data: usize,

    /// Hard upper bound on live connections (queued plus handed out).
    pub max_connections: usize,

    /// Socket receive size used by the recv worker per syscall.
    pub recv_buffer_size: usize,

    /// Socket send size; caller data is chunked to this bound.
    pub send_buffer_size: usize,

    /// Enable TCP keepalive probes on accepted connections.
    pub tcp_keepalive: bool,

    /// Idle time before the first keepalive probe.
    pub tcp_keepalive_time: Duration,

    /// Interval between keepalive probes.
    pub keepalive_interval: Duration,

    /// Memory source handed to the pipelines for receive buffers; `None`
    /// lets each connection allocate its own.
    pub buffer_pool: Option<Arc<BufferPool>>,

    /// Maximum pooled connection objects kept for reuse.
    pub cache_quota: usize,

    /// Optional hook run on the listening socket after bind.
    pub on_socket_created: Option<SocketCreatedHook>,

    /// Emit per-accept debug logging.
    pub debug_tcp_log: bool,
}

impl TcpConfig {
    /// Create a configuration for the given local endpoint with defaults.
    #[must_use]
    pub fn new(local_endpoint: SocketAddr) -> Self {
        Self {
            local_endpoint,
            backlog: 1024,
            accept_threads: 1,
            max_recv_buffer_data: 64 * 1024,
            max_connections: usize::MAX,
            recv_buffer_size: 8192,
            send_buffer_size: 8192,
            tcp_keepalive: false,
            tcp_keepalive_time: Duration::from_secs(7200),
            keepalive_interval: Duration::from_secs(75),
            buffer_pool: None,
            cache_quota: 256,
            on_socket_created: None,
            debug_tcp_log: false,
        }
    }

    /// Set the `listen(2)` backlog.
    #[must_use]
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the number of accept workers.
    #[must_use]
    pub fn with_accept_threads(mut self, threads: usize) -> Self {
        self.accept_threads = threads;
        self
    }

    /// Set the receive pipe's pause-writer threshold in bytes.
    #[must_use]
    pub fn with_max_recv_buffer_data(mut self, bytes: usize) -> Self {
        self.max_recv_buffer_data = bytes;
        self
    }

    /// Set the hard bound on live connections.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set per-syscall receive and per-chunk send sizes.
    #[must_use]
    pub fn with_buffer_sizes(mut self, recv: usize, send: usize) -> Self {
        self.recv_buffer_size = recv;
        self.send_buffer_size = send;
        self
    }

    /// Enable keepalive with the given idle time and probe interval.
    #[must_use]
    pub fn with_keepalive(mut self, time: Duration, interval: Duration) -> Self {
        self.tcp_keepalive = true;
        self.tcp_keepalive_time = time;
        self.keepalive_interval = interval;
        self
    }

    /// Hand the pipelines a shared receive-buffer pool.
    #[must_use]
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// Set the maximum number of pooled connection objects.
    #[must_use]
    pub fn with_cache_quota(mut self, quota: usize) -> Self {
        self.cache_quota = quota;
        self
    }

    /// Install a hook run on the listening socket after bind.
    #[must_use]
    pub fn with_socket_created_hook(mut self, hook: SocketCreatedHook) -> Self {
        self.on_socket_created = Some(hook);
        self
    }

    /// Enable per-accept debug logging.
    #[must_use]
    pub fn with_debug_tcp_log(mut self, enabled: bool) -> Self {
        self.debug_tcp_log = enabled;
        self
    }

    /// Validate the option set.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when a bound is violated.
    pub fn validate(&self) -> Result<()> {
        if self.accept_threads < 1 {
            return Err(CoreError::InvalidArgument("accept_threads must be >= 1"));
        }
        if self.max_recv_buffer_data < 4096 {
            return Err(CoreError::InvalidArgument(
                "max_recv_buffer_data must be >= 4096",
            ));
        }
        if self.max_connections == 0 {
            return Err(CoreError::InvalidArgument("max_connections must be >= 1"));
        }
        if self.recv_buffer_size == 0 || self.send_buffer_size == 0 {
            return Err(CoreError::InvalidArgument("buffer sizes must be non-zero"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TcpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConfig")
            .field("local_endpoint", &self.local_endpoint)
            .field("backlog", &self.backlog)
            .field("accept_threads", &self.accept_threads)
            .field("max_recv_buffer_data", &self.max_recv_buffer_data)
            .field("max_connections", &self.max_connections)
            .field("recv_buffer_size", &self.recv_buffer_size)
            .field("send_buffer_size", &self.send_buffer_size)
            .field("tcp_keepalive", &self.tcp_keepalive)
            .field("has_buffer_pool", &self.buffer_pool.is_some())
            .field("cache_quota", &self.cache_quota)
            .field("has_socket_hook", &self.on_socket_created.is_some())
            .field("debug_tcp_log", &self.debug_tcp_log)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TcpConfig {
        TcpConfig::new("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn defaults_are_valid() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_zero_accept_threads() {
        let config = base().with_accept_threads(0);
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_small_recv_threshold() {
        let config = base().with_max_recv_buffer_data(4095);
        assert!(config.validate().is_err());
        let config = base().with_max_recv_buffer_data(4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_chain() {
        let config = base()
            .with_backlog(64)
            .with_max_connections(8)
            .with_buffer_sizes(4096, 2048)
            .with_cache_quota(4);
        assert_eq!(config.backlog, 64);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.recv_buffer_size, 4096);
        assert_eq!(config.send_buffer_size, 2048);
        assert_eq!(config.cache_quota, 4);
    }
}
