//! Bounded SPSC byte pipe.
//!
//! One pipe per direction decouples socket I/O from caller stream I/O. The
//! writer stages bytes locally and publishes them as immutable segments; the
//! reader consumes segments into caller buffers, parking leftovers so a
//! cancelled read never corrupts the stream.
//!
//! Flow control is byte-based: once the unconsumed bytes in flight exceed the
//! pause threshold, `flush` suspends until the reader drains. Publication
//! itself is synchronous and atomic, so dropping a pending `flush` future
//! (timeout, cancel token) leaves the staged bytes intact for a retry.
//!
//! Each half is an owned handle: single producer, single consumer, enforced
//! by ownership rather than locks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::buffer::SegmentQueue;
use crate::error::{CoreError, Result};

/// Terminal state shared by the two halves.
#[derive(Default)]
struct Terminal {
    /// Writer called `complete`; no further segments will arrive.
    completed: bool,
    /// Error recorded at completion, surfaced to the reader exactly once.
    error: Option<CoreError>,
    /// Reader called `cancel`; the writer's next flush observes it.
    reader_canceled: bool,
}

struct Shared {
    term: Mutex<Terminal>,
    /// Published but not yet consumed bytes.
    in_flight: AtomicUsize,
    /// Abort edge: dropped on reader cancellation to wake a pending read
    /// or a writer paused in its drain wait, without holding either half.
    abort_rx: flume::Receiver<()>,
    abort_tx: Mutex<Option<flume::Sender<()>>>,
}

impl Shared {
    fn reader_gone(&self) -> bool {
        self.term.lock().reader_canceled
    }

    fn take_error(&self) -> Option<CoreError> {
        self.term.lock().error.take()
    }

    fn cancel_reader(&self) {
        self.term.lock().reader_canceled = true;
        drop(self.abort_tx.lock().take());
    }
}

/// Cancels the consuming side of a pipe without borrowing the reader.
///
/// The close path uses this to abort a pending read that is holding the
/// stream's read lock.
#[derive(Clone)]
pub struct PipeAbortHandle {
    shared: Arc<Shared>,
}

impl PipeAbortHandle {
    /// Cancel the reader: a pending `recv` returns `Canceled`, later reads
    /// are rejected, and the writer's next flush observes the cancellation.
    pub fn cancel(&self) {
        self.shared.cancel_reader();
    }
}

/// Create a pipe pair with the given pause threshold in bytes.
#[must_use]
pub fn pipe(pause_threshold: usize) -> (PipeWriter, PipeReader) {
    let (data_tx, data_rx) = flume::unbounded();
    let (drain_tx, drain_rx) = flume::bounded(1);
    let (abort_tx, abort_rx) = flume::bounded(0);
    let shared = Arc::new(Shared {
        term: Mutex::new(Terminal::default()),
        in_flight: AtomicUsize::new(0),
        abort_rx,
        abort_tx: Mutex::new(Some(abort_tx)),
    });
    (
        PipeWriter {
            data_tx: Some(data_tx),
            drain_rx,
            staging: BytesMut::with_capacity(pause_threshold.min(64 * 1024)),
            mark: 0,
            armed: false,
            pause_threshold,
            shared: shared.clone(),
        },
        PipeReader {
            data_rx: Some(data_rx),
            drain_tx: Some(drain_tx),
            buffered: SegmentQueue::new(),
            shared,
        },
    )
}

/// Producing half of a byte pipe.
pub struct PipeWriter {
    data_tx: Option<flume::Sender<Bytes>>,
    drain_rx: flume::Receiver<()>,
    staging: BytesMut,
    /// Staging length before the last `writable` reservation.
    mark: usize,
    /// A `writable` span is outstanding and must be committed first.
    armed: bool,
    pause_threshold: usize,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Reserve a writable span of `hint` bytes in the staging buffer.
    ///
    /// The caller deposits bytes into the span and then calls [`commit`]
    /// with the count actually written; uncommitted tail bytes are dropped.
    ///
    /// [`commit`]: PipeWriter::commit
    pub fn writable(&mut self, hint: usize) -> &mut [u8] {
        debug_assert!(!self.armed, "writable() called twice without commit()");
        self.mark = self.staging.len();
        self.armed = true;
        self.staging.resize(self.mark + hint, 0);
        &mut self.staging[self.mark..]
    }

    /// Commit `n` bytes of the span reserved by [`writable`].
    ///
    /// [`writable`]: PipeWriter::writable
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.armed, "commit() without a writable() span");
        debug_assert!(n <= self.staging.len() - self.mark);
        self.staging.truncate(self.mark + n);
        self.armed = false;
    }

    /// Copy `data` into the staging buffer.
    pub fn push(&mut self, data: &[u8]) {
        debug_assert!(!self.armed, "push() while a writable() span is armed");
        self.staging.extend_from_slice(data);
    }

    /// Whether a `writable` span is outstanding and awaiting `commit`.
    #[must_use]
    pub(crate) const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Bytes staged but not yet published.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    /// Publish the staged bytes as one segment.
    ///
    /// Suspends while the unconsumed bytes in flight exceed the pause
    /// threshold. Cancelling the returned future keeps the staged bytes;
    /// a later flush publishes them unchanged.
    ///
    /// # Errors
    ///
    /// [`CoreError::Canceled`] when the reader cancelled or went away,
    /// [`CoreError::InvalidState`] after `complete`.
    pub async fn flush(&mut self) -> Result<()> {
        debug_assert!(!self.armed, "flush() while a writable() span is armed");
        loop {
            if self.shared.reader_gone() {
                // Surface the reader-recorded error (a socket failure in the
                // consuming worker) once; plain cancellation afterwards.
                return Err(self.shared.take_error().unwrap_or(CoreError::Canceled));
            }
            if self.shared.in_flight.load(Ordering::Acquire) <= self.pause_threshold {
                break;
            }
            // Suspension point: wait for the reader to drain, or for the
            // abort edge. Tokens may be stale, so the watermark and the
            // cancel flag are re-checked on every wakeup.
            futures::select! {
                drained = self.drain_rx.recv_async().fuse() => {
                    if drained.is_err() {
                        return Err(self.shared.take_error().unwrap_or(CoreError::Canceled));
                    }
                }
                _aborted = self.shared.abort_rx.recv_async().fuse() => {}
            }
        }

        if self.staging.is_empty() {
            return Ok(());
        }
        let tx = self
            .data_tx
            .as_ref()
            .ok_or(CoreError::InvalidState("pipe writer completed"))?;
        let seg = self.staging.split().freeze();
        self.shared.in_flight.fetch_add(seg.len(), Ordering::AcqRel);
        if let Err(flume::SendError(seg)) = tx.send(seg) {
            self.shared.in_flight.fetch_sub(seg.len(), Ordering::AcqRel);
            return Err(CoreError::Canceled);
        }
        Ok(())
    }

    /// Complete this direction, optionally recording the causing error.
    ///
    /// Buffered segments still drain to the reader; afterwards the reader
    /// observes the error (once) or clean EOF. Idempotent.
    pub fn complete(&mut self, error: Option<CoreError>) {
        {
            let mut term = self.shared.term.lock();
            if !term.completed {
                term.completed = true;
                term.error = error;
            }
        }
        drop(self.data_tx.take());
    }

    /// Whether `complete` has been called on this writer.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.data_tx.is_none()
    }
}

/// Consuming half of a byte pipe.
pub struct PipeReader {
    data_rx: Option<flume::Receiver<Bytes>>,
    drain_tx: Option<flume::Sender<()>>,
    buffered: SegmentQueue,
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Consume up to `buf.len()` bytes.
    ///
    /// Returns 0 on EOF (writer completed and everything drained). Bytes
    /// buffered when the returned future is cancelled stay queued for the
    /// next call, in order.
    ///
    /// # Errors
    ///
    /// The completion error recorded by the writer (surfaced once), or
    /// [`CoreError::InvalidState`] after `cancel`.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(CoreError::InvalidArgument("zero-length read buffer"));
        }
        while self.buffered.is_empty() {
            let rx = self
                .data_rx
                .as_ref()
                .ok_or(CoreError::InvalidState("pipe reader canceled"))?;
            if self.shared.reader_gone() {
                return Err(CoreError::InvalidState("pipe reader canceled"));
            }
            let received = futures::select! {
                seg = rx.recv_async().fuse() => seg,
                // Abort edge fired while this read was pending.
                _aborted = self.shared.abort_rx.recv_async().fuse() => {
                    return Err(CoreError::Canceled);
                }
            };
            match received {
                Ok(seg) => self.buffered.push(seg),
                // Disconnect: the writer completed. Surface its error once,
                // then EOF from here on.
                Err(_) => {
                    return match self.shared.take_error() {
                        Some(e) => Err(e),
                        None => Ok(0),
                    };
                }
            }
        }
        let n = self.buffered.drain_into(buf);
        self.mark_consumed(n);
        Ok(n)
    }

    /// Take the next whole segment without consume accounting.
    ///
    /// The send worker uses this to write a segment to the socket across
    /// partial writes, calling [`mark_consumed`] for exactly the bytes the
    /// socket accepted. `Ok(None)` is EOF.
    ///
    /// [`mark_consumed`]: PipeReader::mark_consumed
    pub async fn next_segment(&mut self) -> Result<Option<Bytes>> {
        if let Some(seg) = self.buffered.pop_segment() {
            return Ok(Some(seg));
        }
        let rx = self
            .data_rx
            .as_ref()
            .ok_or(CoreError::InvalidState("pipe reader canceled"))?;
        match rx.recv_async().await {
            Ok(seg) => Ok(Some(seg)),
            Err(_) => match self.shared.take_error() {
                Some(e) => Err(e),
                None => Ok(None),
            },
        }
    }

    /// Account `n` consumed bytes and wake a paused writer.
    pub fn mark_consumed(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.shared.in_flight.fetch_sub(n, Ordering::AcqRel);
        if let Some(tx) = &self.drain_tx {
            // Lossy by design: one pending token is enough, the writer
            // re-checks the watermark on wakeup.
            let _ = tx.try_send(());
        }
    }

    /// Bytes parked locally by cancelled or short reads.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Detachable handle that can cancel this reader without borrowing it.
    #[must_use]
    pub fn abort_handle(&self) -> PipeAbortHandle {
        PipeAbortHandle {
            shared: self.shared.clone(),
        }
    }

    /// Cancel this direction from the consumer side.
    ///
    /// The writer's pending or next `flush` returns `Canceled`; buffered
    /// segments are discarded.
    pub fn cancel(&mut self) {
        self.shared.cancel_reader();
        self.mark_consumed(self.buffered.len());
        self.buffered.clear();
        drop(self.data_rx.take());
        drop(self.drain_tx.take());
    }

    /// Cancel this direction, recording the causing error for the writer.
    ///
    /// The consuming worker uses this on socket failure so the producer's
    /// next `flush` surfaces the I/O error instead of a bare cancellation.
    pub fn fail(&mut self, error: CoreError) {
        {
            let mut term = self.shared.term.lock();
            if term.error.is_none() {
                term.error = Some(error);
            }
        }
        self.cancel();
    }

    /// Whether `cancel` has been called on this reader.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.data_rx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rt() -> compio::runtime::Runtime {
        compio::runtime::Runtime::new().unwrap()
    }

    #[test]
    fn roundtrip_preserves_bytes() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(1024);
            w.push(b"hello ");
            w.flush().await.unwrap();
            w.push(b"world");
            w.flush().await.unwrap();

            let mut buf = [0u8; 16];
            let n = r.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello ");
            let n = r.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"world");
        });
    }

    #[test]
    fn writable_commit_publishes_exact_count() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(1024);
            let span = w.writable(8);
            span[..3].copy_from_slice(b"abc");
            w.commit(3);
            w.flush().await.unwrap();

            let mut buf = [0u8; 8];
            let n = r.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"abc");
        });
    }

    #[test]
    fn eof_after_complete() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(1024);
            w.push(b"tail");
            w.flush().await.unwrap();
            w.complete(None);

            let mut buf = [0u8; 8];
            assert_eq!(r.recv(&mut buf).await.unwrap(), 4);
            assert_eq!(r.recv(&mut buf).await.unwrap(), 0);
            assert_eq!(r.recv(&mut buf).await.unwrap(), 0);
        });
    }

    #[test]
    fn completion_error_surfaces_once() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(1024);
            w.complete(Some(CoreError::Corrupted("socket")));

            let mut buf = [0u8; 8];
            assert!(matches!(
                r.recv(&mut buf).await,
                Err(CoreError::Corrupted(_))
            ));
            // Error was consumed; subsequent reads are plain EOF.
            assert_eq!(r.recv(&mut buf).await.unwrap(), 0);
        });
    }

    #[test]
    fn reader_cancel_fails_writer_flush() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(1024);
            r.cancel();
            w.push(b"x");
            assert!(matches!(w.flush().await, Err(CoreError::Canceled)));
        });
    }

    #[test]
    fn timed_out_read_loses_nothing() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(1024);

            let mut buf = [0u8; 8];
            // Nothing published yet: the read must time out without
            // disturbing pipe state.
            let timed = compio::time::timeout(Duration::from_millis(20), r.recv(&mut buf)).await;
            assert!(timed.is_err());

            w.push(b"late");
            w.flush().await.unwrap();
            let n = r.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"late");
        });
    }

    #[test]
    fn flush_pauses_above_threshold() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(4);
            w.push(b"aaaaaaaa"); // 8 bytes, above the 4-byte threshold
            w.flush().await.unwrap();

            // Second flush must pause until the reader drains.
            w.push(b"bb");
            let blocked =
                compio::time::timeout(Duration::from_millis(20), w.flush()).await;
            assert!(blocked.is_err(), "flush should pause above threshold");

            let mut buf = [0u8; 8];
            assert_eq!(r.recv(&mut buf).await.unwrap(), 8);

            // Drained below threshold: the retried flush completes and the
            // staged bytes were preserved across the cancelled attempt.
            w.flush().await.unwrap();
            let n = r.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"bb");
        });
    }

    #[test]
    fn abort_handle_cancels_a_pending_read() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(1024);
            let abort = r.abort_handle();

            let reader_task = compio::runtime::spawn(async move {
                let mut buf = [0u8; 8];
                let pending = r.recv(&mut buf).await;
                let followup = r.recv(&mut buf).await;
                (pending, followup)
            });
            compio::time::sleep(Duration::from_millis(10)).await;
            abort.cancel();

            let (pending, followup) = reader_task.await;
            assert!(matches!(pending, Err(CoreError::Canceled)));
            assert!(matches!(followup, Err(CoreError::InvalidState(_))));

            // The writer observes the cancellation as well.
            w.push(b"x");
            assert!(matches!(w.flush().await, Err(CoreError::Canceled)));
        });
    }

    #[test]
    fn send_worker_view_accounts_partial_consumption() {
        rt().block_on(async {
            let (mut w, mut r) = pipe(16);
            w.push(b"segment");
            w.flush().await.unwrap();

            let seg = r.next_segment().await.unwrap().unwrap();
            assert_eq!(&seg[..], b"segment");
            // Simulate two partial socket writes.
            r.mark_consumed(3);
            r.mark_consumed(4);

            w.complete(None);
            assert!(r.next_segment().await.unwrap().is_none());
        });
    }
}
