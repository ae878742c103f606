//! Awaitable server socket.
//!
//! One reusable pool object per accepted connection: it owns the kernel
//! socket, the socket pipeline and the two worker task handles, from accept
//! through close. The close path is ordered so that both workers have
//! unwound before the caller gets control back, which is what makes pool
//! reuse of the object safe.

use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use compio::net::{TcpListener, TcpStream};
use compio::runtime::TryClone;
use tracing::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::error::{CoreError, Result};
use crate::pipeline::{run_recv_worker, run_send_worker, PipeStream, SocketPipeline};
use crate::tcp;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Reusable per-connection descriptor.
pub struct ServerSocket {
    id: u64,
    socket: Option<TcpStream>,
    pipeline: SocketPipeline,
    send_task: Option<compio::runtime::Task<()>>,
    recv_task: Option<compio::runtime::Task<()>>,
}

impl ServerSocket {
    /// Create an unconnected descriptor whose recv pipe pauses writers at
    /// `pause_threshold` bytes.
    #[must_use]
    pub fn new(pause_threshold: usize) -> Self {
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            socket: None,
            pipeline: SocketPipeline::new(pause_threshold),
            send_task: None,
            recv_task: None,
        }
    }

    /// Stable identity of this object across pool reuse.
    #[must_use]
    pub const fn instance_id(&self) -> u64 {
        self.id
    }

    /// Whether an accepted kernel socket is currently attached.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Pool hook: re-arm the pipeline for a fresh accept.
    pub fn prepare(&mut self) {
        self.pipeline.prepare();
    }

    /// Pool hook: tear down transient state.
    ///
    /// Both workers must have unwound; a stale kernel socket left behind by
    /// a failed close is discarded here.
    pub fn release(&mut self) {
        debug_assert_eq!(
            self.pipeline.live_workers(),
            0,
            "release() with live pipeline workers"
        );
        if let Some(stale) = self.socket.take() {
            trace!("[ServerSocket] Discarding stale kernel socket");
            drop(stale);
        }
        self.pipeline.release();
    }

    /// Accept one connection from the shared listening socket and start the
    /// pipeline workers.
    ///
    /// This platform performs a plain accept; the recv worker is handed the
    /// number of bytes transferred during accept, which is always zero here.
    /// On accept failure the error is returned without starting workers.
    ///
    /// # Errors
    ///
    /// `InvalidState` when already connected, `Io` on accept failure.
    pub async fn accept(&mut self, listener: &TcpListener, config: &TcpConfig) -> Result<()> {
        if self.socket.is_some() {
            return Err(CoreError::InvalidState("descriptor already connected"));
        }

        let (stream, peer) = listener.accept().await?;
        if let Err(e) = tcp::tune_stream(&stream, config) {
            warn!("[ServerSocket] Socket tuning failed for {peer}: {e}");
        }
        if config.debug_tcp_log {
            debug!("[ServerSocket] Accepted connection from {peer}");
        }

        self.pipeline.set_chunk_size(config.send_buffer_size);
        let halves = self.pipeline.take_worker_halves()?;

        self.send_task = Some(compio::runtime::spawn(run_send_worker(
            halves.send_reader,
            stream.try_clone()?,
            halves.unwind.clone(),
            halves.send_guard,
        )));
        self.recv_task = Some(compio::runtime::spawn(run_recv_worker(
            halves.recv_writer,
            stream.try_clone()?,
            0,
            config.recv_buffer_size,
            config.buffer_pool.clone(),
            halves.unwind,
            halves.recv_guard,
        )));
        self.socket = Some(stream);
        Ok(())
    }

    /// Close the connection, draining both workers before returning.
    ///
    /// Order: complete the caller-facing pipe ends, await the send worker,
    /// shut the socket down (waking a blocked receive), await the recv
    /// worker, then release the kernel socket. The platform has no
    /// disconnect-for-reuse primitive, so `reuse` keeps only the descriptor
    /// object; the kernel socket is always released.
    ///
    /// # Errors
    ///
    /// `Io` when the socket shutdown fails on a live connection.
    pub async fn close(&mut self, reuse: bool) -> Result<()> {
        self.pipeline.shutdown_client_pipes().await;

        if let Some(task) = self.send_task.take() {
            task.await;
        }

        let socket = self.socket.take();
        let mut shutdown_result = Ok(());
        if let Some(stream) = &socket {
            shutdown_result = match tcp::shutdown_stream(stream, Shutdown::Both) {
                Ok(()) => Ok(()),
                // Peer already tore the connection down; not a close failure.
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
                Err(e) => Err(CoreError::Io(e)),
            };
        }

        if let Some(task) = self.recv_task.take() {
            task.await;
        }

        drop(socket);
        let _ = reuse;
        shutdown_result
    }

    /// Borrow the pipeline's stream facade.
    #[must_use]
    pub fn stream(&self) -> PipeStream<'_> {
        self.pipeline.stream()
    }

    /// Borrow the pipeline itself (timeout configuration, direct I/O).
    #[must_use]
    pub const fn pipeline(&self) -> &SocketPipeline {
        &self.pipeline
    }

    /// Mutable pipeline access for the accept path (`get_memory`).
    pub fn pipeline_mut(&mut self) -> &mut SocketPipeline {
        &mut self.pipeline
    }

    /// Local endpoint of the accepted socket.
    ///
    /// # Errors
    ///
    /// `InvalidState` when not connected.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let sock = self
            .socket
            .as_ref()
            .ok_or(CoreError::InvalidState("descriptor not connected"))?;
        Ok(sock.local_addr()?)
    }

    /// Remote endpoint of the accepted socket.
    ///
    /// # Errors
    ///
    /// `InvalidState` when not connected.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let sock = self
            .socket
            .as_ref()
            .ok_or(CoreError::InvalidState("descriptor not connected"))?;
        Ok(sock.peer_addr()?)
    }
}

impl std::fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSocket")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("live_workers", &self.pipeline.live_workers())
            .finish()
    }
}
