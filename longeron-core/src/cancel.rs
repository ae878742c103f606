//! Cooperative cancellation tokens.
//!
//! A [`CancelToken`] is a cloneable flag plus a wakeup edge. Cancelling one
//! clone is observed by every clone, both synchronously (`is_canceled`) and
//! asynchronously (`cancelled().await`). Child tokens link to their parent:
//! cancelling the parent cancels the whole subtree, while a child can be
//! cancelled without touching its parent.
//!
//! The wakeup edge is a zero-capacity flume channel whose sender is dropped
//! on cancel; waiters simply observe the disconnect. No background task, no
//! per-wait allocation beyond the future itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct Inner {
    canceled: AtomicBool,
    tx: Mutex<Option<flume::Sender<()>>>,
    rx: flume::Receiver<()>,
}

impl Inner {
    fn new() -> Arc<Self> {
        let (tx, rx) = flume::bounded(0);
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx,
        })
    }

    fn cancel(&self) {
        // Flag first so is_canceled() is accurate before the wakeup lands.
        self.canceled.store(true, Ordering::Release);
        drop(self.tx.lock().take());
    }
}

/// Cloneable, linkable cancellation token.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
    /// Ancestry chain, nearest parent last. Cancelling any ancestor
    /// cancels this token.
    ancestors: Vec<Arc<Inner>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Inner::new(),
            ancestors: Vec::new(),
        }
    }

    /// Create a token linked to this one.
    ///
    /// The child observes cancellation of `self` (and of any of `self`'s
    /// ancestors); cancelling the child does not affect `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.inner.clone());
        Self {
            inner: Inner::new(),
            ancestors,
        }
    }

    /// Cancel this token and every token linked below it.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check cancellation without suspending.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        if self.inner.canceled.load(Ordering::Acquire) {
            return true;
        }
        self.ancestors
            .iter()
            .any(|a| a.canceled.load(Ordering::Acquire))
    }

    /// Suspend until this token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        if self.is_canceled() {
            return;
        }
        // All wait edges share the RecvFut type, so a single select works
        // for any chain depth. A disconnect on any edge means cancel.
        let mut waits = Vec::with_capacity(self.ancestors.len() + 1);
        waits.push(self.inner.rx.recv_async());
        for a in &self.ancestors {
            waits.push(a.rx.recv_async());
        }
        let _ = futures::future::select_all(waits).await;
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .field("depth", &self.ancestors.len())
            .finish()
    }
}
