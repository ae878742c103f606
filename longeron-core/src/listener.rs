//! TCP listener node.
//!
//! Binds one listening socket, runs N accept workers over it, and publishes
//! accepted connections on an MPMC queue. Live connections are bounded by
//! `max_connections`; connection objects are pooled up to `cache_quota` so
//! steady-state accepts allocate nothing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use compio::net::TcpListener;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::config::TcpConfig;
use crate::descriptor::ServerSocket;
use crate::error::{CoreError, Result};
use crate::pool::ObjectPool;
use crate::tcp;

struct NodeShared {
    cancel: CancelToken,
    /// Connections queued or handed out, bounded by `max_connections`.
    live: AtomicUsize,
    pool: ObjectPool<ServerSocket>,
}

/// Multi-worker TCP listener node.
pub struct TcpServer {
    config: Arc<TcpConfig>,
    shared: Arc<NodeShared>,
    queue_rx: flume::Receiver<ServerSocket>,
    queue_tx: Option<flume::Sender<ServerSocket>>,
    workers: Vec<compio::runtime::Task<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpServer {
    /// Create a node from a validated-later configuration.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        let pool = ObjectPool::new(config.cache_quota);
        let (queue_tx, queue_rx) = flume::unbounded();
        Self {
            config: Arc::new(config),
            shared: Arc::new(NodeShared {
                cancel: CancelToken::new(),
                live: AtomicUsize::new(0),
                pool,
            }),
            queue_rx,
            queue_tx: Some(queue_tx),
            workers: Vec::new(),
            local_addr: None,
        }
    }

    /// Bind the listening socket and start the accept workers.
    ///
    /// A bind failure is fatal and returned to the caller; nothing is
    /// started in that case.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` from configuration validation, `InvalidState` when
    /// already listening, `Io` on bind failure.
    pub async fn listen(&mut self) -> Result<SocketAddr> {
        if self.local_addr.is_some() {
            return Err(CoreError::InvalidState("node is already listening"));
        }
        self.config.validate()?;

        let cpus = num_cpus::get();
        if self.config.accept_threads > cpus {
            warn!(
                "[TcpServer] accept_threads ({}) exceeds logical processors ({cpus})",
                self.config.accept_threads
            );
        }

        let listener = TcpListener::bind(self.config.local_endpoint).await?;
        if let Err(e) = tcp::tune_listener(&listener, &self.config) {
            warn!("[TcpServer] Listener tuning failed: {e}");
        }
        let local = listener.local_addr()?;
        debug!("[TcpServer] Listening on {local}");

        let listener = Arc::new(listener);
        let queue_tx = self
            .queue_tx
            .take()
            .ok_or(CoreError::InvalidState("node was already closed"))?;
        for worker_id in 0..self.config.accept_threads {
            self.workers.push(compio::runtime::spawn(accept_worker(
                worker_id,
                listener.clone(),
                queue_tx.clone(),
                self.shared.clone(),
                self.config.clone(),
            )));
        }
        // Workers hold the only queue senders: when the last worker exits,
        // pending accept() callers observe the disconnect.
        drop(queue_tx);

        self.local_addr = Some(local);
        Ok(local)
    }

    /// Address the node is bound to, once listening.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connections currently queued or handed out.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Idle descriptors cached for reuse.
    #[must_use]
    pub fn pooled_connections(&self) -> usize {
        self.shared.pool.cached()
    }

    /// Whether `close` has been requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_canceled()
    }

    /// Take the next accepted connection.
    ///
    /// # Errors
    ///
    /// `InvalidState` once the node is closed and the queue is drained.
    pub async fn accept(&self) -> Result<ServerSocket> {
        self.queue_rx
            .recv_async()
            .await
            .map_err(|_| CoreError::InvalidState("listener node closed"))
    }

    /// Request shutdown: pending accepts abort and workers exit.
    ///
    /// The listening socket is released when the last worker drops its
    /// handle; await [`wait_for_exit`](Self::wait_for_exit) for that point.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Wait until every accept worker has returned, then dispose any
    /// still-queued connections and drain the object pool.
    pub async fn wait_for_exit(&mut self) {
        for task in self.workers.drain(..) {
            task.await;
        }
        while let Ok(mut desc) = self.queue_rx.try_recv() {
            let _ = desc.close(false).await;
            desc.release();
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
        self.shared.pool.drain();
        debug!("[TcpServer] All accept workers exited");
    }

    /// Close an accepted connection.
    ///
    /// On success the descriptor object is returned to the pool iff `reuse`
    /// was requested and the node is not shutting down; a failed close
    /// disposes the descriptor instead.
    ///
    /// # Errors
    ///
    /// Propagates the close failure after disposing the descriptor.
    pub async fn close_connection(&self, mut desc: ServerSocket, reuse: bool) -> Result<()> {
        let closed = desc.close(reuse).await;
        self.shared.live.fetch_sub(1, Ordering::AcqRel);
        desc.release();
        match closed {
            Ok(()) => {
                if reuse && !self.shared.cancel.is_canceled() {
                    self.shared.pool.give_back(desc);
                }
                Ok(())
            }
            Err(e) => {
                // Disposed, not pooled.
                drop(desc);
                Err(e)
            }
        }
    }
}

/// One accept loop. N of these share the listening socket; the OS
/// serializes the actual accept.
async fn accept_worker(
    worker_id: usize,
    listener: Arc<TcpListener>,
    queue: flume::Sender<ServerSocket>,
    shared: Arc<NodeShared>,
    config: Arc<TcpConfig>,
) {
    loop {
        if shared.cancel.is_canceled() {
            break;
        }

        let mut desc = shared
            .pool
            .rent(|| ServerSocket::new(config.max_recv_buffer_data));
        desc.prepare();

        // Dropping the accept future on cancellation aborts the pending
        // accept without touching the descriptor's state.
        let accepted = {
            let mut accept = std::pin::pin!(desc.accept(&listener, &config).fuse());
            let mut closing = std::pin::pin!(shared.cancel.cancelled().fuse());
            futures::select! {
                res = accept => Some(res),
                () = closing => None,
            }
        };

        match accepted {
            None => {
                desc.release();
                shared.pool.give_back(desc);
                break;
            }
            Some(Ok(())) => {
                // Claim a connection slot before publishing.
                let prev = shared.live.fetch_add(1, Ordering::AcqRel);
                if prev >= config.max_connections {
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    debug!("[TcpServer] Worker {worker_id} over connection limit, closing accept");
                    let _ = desc.close(false).await;
                    desc.release();
                    shared.pool.give_back(desc);
                    continue;
                }
                if config.debug_tcp_log {
                    debug!("[TcpServer] Worker {worker_id} published a connection");
                }
                if let Err(flume::SendError(mut rejected)) = queue.send(desc) {
                    // Queue consumer is gone; treat like shutdown.
                    let _ = rejected.close(false).await;
                    rejected.release();
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
            }
            Some(Err(e)) => {
                desc.release();
                shared.pool.give_back(desc);
                if shared.cancel.is_canceled() {
                    break;
                }
                error!("[TcpServer] Worker {worker_id} accept failed: {e}");
                // Back off briefly so a persistent failure does not spin.
                compio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("[TcpServer] Worker {worker_id} exited");
}
