//! Bounded connection-object pool.
//!
//! Accepted-connection descriptors carry pipes, staging buffers and timer
//! state that are expensive to rebuild per connection. The listener rents
//! objects here and returns them after a clean close, bounded by the
//! configured cache quota.

use parking_lot::Mutex;

/// Thread-safe bounded object pool.
pub struct ObjectPool<T> {
    slots: Mutex<Vec<T>>,
    quota: usize,
}

impl<T> ObjectPool<T> {
    /// Create a pool retaining at most `quota` idle objects.
    #[must_use]
    pub fn new(quota: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(quota.min(64))),
            quota,
        }
    }

    /// Take a pooled object, or build a fresh one.
    pub fn rent(&self, make: impl FnOnce() -> T) -> T {
        self.slots.lock().pop().unwrap_or_else(make)
    }

    /// Return an object for reuse.
    ///
    /// Returns `false` (dropping the object) when the pool is at quota.
    pub fn give_back(&self, value: T) -> bool {
        let mut slots = self.slots.lock();
        if slots.len() >= self.quota {
            return false;
        }
        slots.push(value);
        true
    }

    /// Number of idle objects currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.slots.lock().len()
    }

    /// Drop every cached object.
    pub fn drain(&self) {
        self.slots.lock().clear();
    }
}

/// Shared pool of receive buffers handed to the pipelines.
///
/// Recv workers rent one buffer for the lifetime of a connection and
/// return it on unwind, so steady-state accepts do not allocate buffer
/// memory.
pub struct BufferPool {
    buffers: ObjectPool<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `quota` buffers of `buffer_size` bytes capacity.
    #[must_use]
    pub fn new(buffer_size: usize, quota: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            buffers: ObjectPool::new(quota),
            buffer_size,
        })
    }

    /// Capacity of the buffers this pool hands out.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Rent an empty buffer with at least `buffer_size` capacity.
    #[must_use]
    pub fn rent(&self) -> Vec<u8> {
        let mut buf = self.buffers.rent(|| Vec::with_capacity(self.buffer_size));
        buf.clear();
        buf
    }

    /// Return a buffer for reuse; oversized or surplus buffers are dropped.
    pub fn give_back(&self, buf: Vec<u8>) {
        if buf.capacity() >= self.buffer_size {
            self.buffers.give_back(buf);
        }
    }

    /// Idle buffers currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.buffers.cached()
    }
}
