//! Socket pipeline worker.
//!
//! Presents a byte stream to higher layers while the actual socket I/O runs
//! on two background tasks (split-pump design):
//! - Send worker: send pipe → kernel
//! - Recv worker: kernel → recv pipe
//!
//! Each direction has an independent timeout that cancels only the pending
//! operation of that direction; buffered state survives, so the caller can
//! retry or tear the connection down as it sees fit. A terminal socket
//! condition in one direction completes that direction's pipe and unwinds
//! the opposite worker through a shared cancellation edge.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite};
use futures::FutureExt;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::{CoreError, Result};
use crate::pipe::{pipe, PipeAbortHandle, PipeReader, PipeWriter};
use crate::pool::BufferPool;

mod io_buf {
    //! Zero-copy `IoBuf` view over `Bytes` for socket writes.
    #![allow(unsafe_code)]

    use bytes::Bytes;

    pub(super) struct IoBytes(Bytes);

    impl IoBytes {
        pub(super) const fn new(bytes: Bytes) -> Self {
            Self(bytes)
        }
    }

    // SAFETY: Bytes is immutable, refcounted and contiguous, so pointer and
    // length stay valid and unaliased for the duration of the IO operation.
    unsafe impl compio::buf::IoBuf for IoBytes {
        #[inline]
        fn as_buf_ptr(&self) -> *const u8 {
            self.0.as_ptr()
        }

        #[inline]
        fn buf_len(&self) -> usize {
            self.0.len()
        }

        #[inline]
        fn buf_capacity(&self) -> usize {
            self.0.len()
        }
    }
}

use io_buf::IoBytes;

#[derive(Clone, Copy, Default)]
struct DirectionTimeouts {
    send: Option<Duration>,
    recv: Option<Duration>,
}

/// Decrements the live-worker counter when a worker unwinds.
pub(crate) struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn arm(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker-side handles taken by the connection object when it starts the
/// background pumps.
pub(crate) struct WorkerHalves {
    pub send_reader: PipeReader,
    pub recv_writer: PipeWriter,
    pub unwind: CancelToken,
    pub send_guard: WorkerGuard,
    pub recv_guard: WorkerGuard,
}

/// Full-duplex byte pipeline between one socket and one caller stream.
pub struct SocketPipeline {
    pause_threshold: usize,
    /// Captured socket send-buffer size; caller data is chunked to it.
    chunk_size: AtomicUsize,
    send_writer: async_lock::Mutex<Option<PipeWriter>>,
    recv_reader: async_lock::Mutex<Option<PipeReader>>,
    /// Cancels a pending caller read without taking the reader lock.
    recv_abort: parking_lot::Mutex<Option<PipeAbortHandle>>,
    send_reader: Option<PipeReader>,
    recv_writer: Option<PipeWriter>,
    timeouts: parking_lot::Mutex<DirectionTimeouts>,
    unwind: CancelToken,
    live_workers: Arc<AtomicUsize>,
}

impl SocketPipeline {
    /// Create an unprepared pipeline with the given recv pause threshold.
    #[must_use]
    pub fn new(pause_threshold: usize) -> Self {
        Self {
            pause_threshold,
            chunk_size: AtomicUsize::new(8192),
            send_writer: async_lock::Mutex::new(None),
            recv_reader: async_lock::Mutex::new(None),
            recv_abort: parking_lot::Mutex::new(None),
            send_reader: None,
            recv_writer: None,
            timeouts: parking_lot::Mutex::new(DirectionTimeouts::default()),
            unwind: CancelToken::new(),
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Rebuild both pipes and reset direction timeouts to infinite.
    ///
    /// Must be called before each (re)use of the owning connection object.
    pub fn prepare(&mut self) {
        let (sw, sr) = pipe(self.pause_threshold);
        let (rw, rr) = pipe(self.pause_threshold);
        *self.send_writer.get_mut() = Some(sw);
        self.send_reader = Some(sr);
        self.recv_writer = Some(rw);
        *self.recv_abort.lock() = Some(rr.abort_handle());
        *self.recv_reader.get_mut() = Some(rr);
        *self.timeouts.lock() = DirectionTimeouts::default();
        self.unwind = CancelToken::new();
    }

    /// Drop both pipes.
    ///
    /// Must not be called while a worker task is still running.
    pub fn release(&mut self) {
        debug_assert_eq!(
            self.live_workers.load(Ordering::Acquire),
            0,
            "release() while pipeline workers are live"
        );
        *self.send_writer.get_mut() = None;
        *self.recv_reader.get_mut() = None;
        *self.recv_abort.lock() = None;
        self.send_reader = None;
        self.recv_writer = None;
    }

    /// Final teardown of pipe and timer state.
    ///
    /// Like [`release`](Self::release) but for a pipeline that will not be
    /// prepared again; must be called only once both worker tasks have
    /// observed termination.
    pub fn dispose(&mut self) {
        self.release();
        *self.timeouts.lock() = DirectionTimeouts::default();
    }

    /// Number of worker tasks that have started but not yet unwound.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    /// Reserve a span of the recv pipe for bytes acquired with the accept.
    ///
    /// The recv worker later commits the count actually transferred (which
    /// may be zero) and publishes it ahead of socket reads.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the pipeline is not prepared or workers already
    /// started.
    pub fn get_memory(&mut self, size_hint: usize) -> Result<&mut [u8]> {
        let writer = self
            .recv_writer
            .as_mut()
            .ok_or(CoreError::InvalidState("pipeline not prepared"))?;
        Ok(writer.writable(size_hint))
    }

    /// Record the socket send-buffer size used to chunk caller data.
    pub(crate) fn set_chunk_size(&self, bytes: usize) {
        self.chunk_size.store(bytes.max(1), Ordering::Release);
    }

    /// Take the worker-side halves; called once per accept.
    pub(crate) fn take_worker_halves(&mut self) -> Result<WorkerHalves> {
        let send_reader = self
            .send_reader
            .take()
            .ok_or(CoreError::InvalidState("pipeline workers already started"))?;
        let recv_writer = self
            .recv_writer
            .take()
            .ok_or(CoreError::InvalidState("pipeline workers already started"))?;
        Ok(WorkerHalves {
            send_reader,
            recv_writer,
            unwind: self.unwind.clone(),
            send_guard: WorkerGuard::arm(&self.live_workers),
            recv_guard: WorkerGuard::arm(&self.live_workers),
        })
    }

    /// Set the send-direction timeout. `None` or zero disables it.
    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().send = normalize(timeout);
    }

    /// Set the recv-direction timeout. `None` or zero disables it.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().recv = normalize(timeout);
    }

    /// Copy `data` into the send pipe and flush, using the configured
    /// send timeout.
    ///
    /// # Errors
    ///
    /// `Timeout` when the direction timer fires (staged bytes are kept),
    /// `Canceled`/`Io` when the send worker tore the direction down.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let timeout = self.timeouts.lock().send;
        self.send_with(data, timeout, None).await
    }

    /// `send` with explicit timeout and optional cooperative cancellation.
    pub async fn send_with(
        &self,
        data: &[u8],
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let mut guard = self.send_writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(CoreError::InvalidState("pipeline not prepared"))?;
        let chunk = self.chunk_size.load(Ordering::Acquire).max(1);
        for piece in data.chunks(chunk) {
            writer.push(piece);
            drive(writer.flush(), normalize(timeout), cancel).await?;
        }
        Ok(())
    }

    /// Consume bytes from the recv pipe, using the configured recv timeout.
    ///
    /// Returns 0 on EOF. A timed-out read leaves buffered bytes in place
    /// for the next call.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.timeouts.lock().recv;
        self.recv_with(buf, timeout, None).await
    }

    /// `recv` with explicit timeout and optional cooperative cancellation.
    pub async fn recv_with(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        let mut guard = self.recv_reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or(CoreError::InvalidState("pipeline not prepared"))?;
        drive(reader.recv(buf), normalize(timeout), cancel).await
    }

    /// Complete the caller-facing ends of both pipes.
    ///
    /// The send worker drains what was flushed and exits; the recv worker
    /// observes its reader canceled and exits. Both workers unwind without
    /// forcing the socket closed. The recv side is aborted through the
    /// lock-free edge so a read pending on the stream cannot stall the
    /// close path.
    pub async fn shutdown_client_pipes(&self) {
        let recv_abort = self.recv_abort.lock().take();
        if let Some(abort) = recv_abort {
            abort.cancel();
        }
        if let Some(writer) = self.send_writer.lock().await.as_mut() {
            writer.complete(None);
        }
    }

    /// Borrow the stream facade for this pipeline.
    #[must_use]
    pub fn stream(&self) -> PipeStream<'_> {
        PipeStream { pipeline: self }
    }
}

/// Non-owning stream view over a [`SocketPipeline`].
///
/// Reads map zero bytes to EOF; writes chunk to the captured socket
/// send-buffer size. The view must not outlive its connection object,
/// which the borrow enforces.
pub struct PipeStream<'a> {
    pipeline: &'a SocketPipeline,
}

impl PipeStream<'_> {
    /// Read into `buf`; `Ok(0)` is EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.pipeline.recv(buf).await
    }

    /// Write all of `data` through the send pipe.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        self.pipeline.send(data).await
    }

    /// Set the read timeout for this direction.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.pipeline.set_recv_timeout(timeout);
    }

    /// Set the write timeout for this direction.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.pipeline.set_send_timeout(timeout);
    }

    /// Complete both directions from the caller side.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown_client_pipes().await;
    }
}

fn normalize(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|d| !d.is_zero())
}

/// Run a pipe operation under an optional timeout and cancel token.
///
/// Cancelling the inner future is safe by construction: pipe publication
/// and consumption are atomic around their suspension points.
async fn drive<T>(
    fut: impl Future<Output = Result<T>>,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
) -> Result<T> {
    let io = async move {
        match cancel {
            None => fut.await,
            Some(token) => {
                let mut fut = std::pin::pin!(fut.fuse());
                let mut canceled = std::pin::pin!(token.cancelled().fuse());
                futures::select! {
                    res = fut => res,
                    () = canceled => Err(CoreError::Canceled),
                }
            }
        }
    };
    match timeout {
        None => io.await,
        Some(d) => match compio::time::timeout(d, io).await {
            Ok(res) => res,
            Err(_) => Err(CoreError::Timeout),
        },
    }
}

/// Long-running send pump: send pipe → socket.
///
/// Every segment read from the pipe is fully written to the socket before
/// the next segment is taken; on partial writes the pipe is advanced by
/// exactly the bytes the socket accepted. Exits when the send pipe
/// completes, the unwind edge fires, or the socket errors (which also
/// unwinds the recv direction).
pub(crate) async fn run_send_worker<S>(
    mut reader: PipeReader,
    mut sock: S,
    unwind: CancelToken,
    guard: WorkerGuard,
) where
    S: AsyncWrite + Unpin + 'static,
{
    let _guard = guard;
    loop {
        let segment = {
            let mut next = std::pin::pin!(reader.next_segment().fuse());
            let mut unwound = std::pin::pin!(unwind.cancelled().fuse());
            futures::select! {
                seg = next => seg,
                () = unwound => {
                    trace!("[Pipeline] Send worker unwound by peer direction");
                    return;
                }
            }
        };
        match segment {
            Ok(Some(seg)) => {
                if let Err(e) = write_segment(&mut sock, &reader, seg).await {
                    trace!("[Pipeline] Send worker socket error: {e}");
                    reader.fail(CoreError::Io(e));
                    unwind.cancel();
                    return;
                }
            }
            // Send pipe completed by the caller: clean drain.
            Ok(None) | Err(_) => return,
        }
    }
}

async fn write_segment<S>(
    sock: &mut S,
    reader: &PipeReader,
    mut remaining: Bytes,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    while !remaining.is_empty() {
        let BufResult(res, _) = sock.write(IoBytes::new(remaining.clone())).await;
        match res {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ));
            }
            Ok(n) => {
                reader.mark_consumed(n);
                remaining.advance(n);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Long-running recv pump: socket → recv pipe.
///
/// First publishes any bytes deposited by the accept path (may be zero),
/// then loops socket receives into the pipe. Terminates on EOF, on
/// recv-pipe cancellation (backpressure flush observing the canceled
/// reader), on the unwind edge, or on socket error; every terminal path
/// completes the recv pipe and unwinds the send direction.
///
/// The receive buffer is rented from `buffer_pool` (when one is
/// configured) for the lifetime of the connection and returned on unwind.
pub(crate) async fn run_recv_worker<S>(
    mut writer: PipeWriter,
    mut sock: S,
    initial_bytes: usize,
    recv_buffer_size: usize,
    buffer_pool: Option<Arc<BufferPool>>,
    unwind: CancelToken,
    guard: WorkerGuard,
) where
    S: AsyncRead + Unpin + 'static,
{
    let _guard = guard;

    // Bytes the accept deposited into the reserved span, if any.
    if writer.is_armed() {
        writer.commit(initial_bytes);
    }
    if writer.staged_len() > 0 {
        if writer.flush().await.is_err() {
            writer.complete(None);
            unwind.cancel();
            return;
        }
        trace!("[Pipeline] Published {initial_bytes} accept bytes");
    }

    let mut buf = Some(
        buffer_pool
            .as_ref()
            .map_or_else(|| Vec::with_capacity(recv_buffer_size), |p| p.rent()),
    );
    loop {
        let mut pending = buf.take().expect("buffer restored every iteration");
        pending.clear();
        let result = {
            let mut read = std::pin::pin!(sock.read(pending).fuse());
            let mut unwound = std::pin::pin!(unwind.cancelled().fuse());
            futures::select! {
                res = read => res,
                () = unwound => {
                    // The buffer is owned by the cancelled read; it cannot
                    // be returned to the pool.
                    trace!("[Pipeline] Recv worker unwound by peer direction");
                    writer.complete(None);
                    break;
                }
            }
        };
        let BufResult(res, returned) = result;
        buf = Some(returned);
        match res {
            Ok(0) => {
                trace!("[Pipeline] Recv worker observed EOF");
                writer.complete(None);
                unwind.cancel();
                break;
            }
            Ok(n) => {
                let data = buf.as_ref().expect("restored above");
                writer.push(&data[..n]);
                // Suspension point: backpressure pause until readers drain.
                if writer.flush().await.is_err() {
                    writer.complete(None);
                    unwind.cancel();
                    break;
                }
            }
            Err(e) => {
                trace!("[Pipeline] Recv worker socket error: {e}");
                writer.complete(Some(CoreError::Io(e)));
                unwind.cancel();
                break;
            }
        }
    }
    if let (Some(pool), Some(recycled)) = (&buffer_pool, buf.take()) {
        pool.give_back(recycled);
    }
}
