use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// An ordered queue of byte segments consumed from the front.
///
/// The pipe reader parks segments here between caller reads, so a cancelled
/// or timed-out read never loses data: whatever arrived stays queued, in
/// order, for the next read.
///
/// Consuming from a single segment is a slice copy plus a refcount bump on
/// the underlying `Bytes`; no reallocation, no segment merging.
#[derive(Debug, Default)]
pub struct SegmentQueue {
    segs: VecDeque<Bytes>,
    len: usize,
}

impl SegmentQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Copy up to `dst.len()` bytes into `dst`, consuming them.
    ///
    /// Returns the number of bytes copied (0 when empty).
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            let take = front.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&front[..take]);
            copied += take;
            if take < front.len() {
                front.advance(take);
                self.segs.push_front(front);
            }
        }
        self.len -= copied;
        copied
    }

    /// Pop the front segment whole, if any.
    pub fn pop_segment(&mut self) -> Option<Bytes> {
        let front = self.segs.pop_front()?;
        self.len -= front.len();
        Some(front)
    }

    /// Drop all queued segments.
    pub fn clear(&mut self) {
        self.segs.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_spans_segments_in_order() {
        let mut q = SegmentQueue::new();
        q.push(Bytes::from_static(b"ab"));
        q.push(Bytes::from_static(b"cde"));
        q.push(Bytes::from_static(b"f"));
        assert_eq!(q.len(), 6);

        let mut dst = [0u8; 4];
        assert_eq!(q.drain_into(&mut dst), 4);
        assert_eq!(&dst, b"abcd");
        assert_eq!(q.len(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(q.drain_into(&mut rest), 2);
        assert_eq!(&rest[..2], b"ef");
        assert!(q.is_empty());
    }

    #[test]
    fn empty_segments_are_ignored() {
        let mut q = SegmentQueue::new();
        q.push(Bytes::new());
        assert!(q.is_empty());
        assert!(q.pop_segment().is_none());
    }

    #[test]
    fn pop_segment_returns_whole_front() {
        let mut q = SegmentQueue::new();
        q.push(Bytes::from_static(b"xyz"));
        q.push(Bytes::from_static(b"w"));
        assert_eq!(q.pop_segment().unwrap(), Bytes::from_static(b"xyz"));
        assert_eq!(q.len(), 1);
    }
}
