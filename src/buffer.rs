//! Owned byte buffer with explicit read/write cursors.

/// A fixed-capacity byte buffer handed out by a [`BufferPool`](crate::buffer_pool::BufferPool).
///
/// Bytes in `start..end` are readable; bytes in `end..capacity` are free for
/// the next socket read. The buffer never reallocates in place: growing means
/// obtaining a larger buffer from the pool and copying the readable bytes
/// forward (see [`BufferPool::ensure_capacity`](crate::buffer_pool::BufferPool::ensure_capacity)).
#[derive(Debug)]
pub struct ByteBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
    pooled: bool,
}

impl ByteBuffer {
    /// A chunk-sized buffer that goes back to the pool on recycle.
    pub(crate) fn chunk(size: usize) -> Self {
        Self {
            data: vec![0; size],
            start: 0,
            end: 0,
            pooled: true,
        }
    }

    /// A temporary buffer larger than the pool's chunk size.
    pub(crate) fn oversized(size: usize) -> Self {
        Self {
            data: vec![0; size],
            start: 0,
            end: 0,
            pooled: false,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether this buffer is a pooled chunk (as opposed to a temporary oversized one).
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Offset of the first readable byte.
    pub fn offset(&self) -> usize {
        self.start
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Check if there are no readable bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Free space after the readable region.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.end
    }

    /// Readable bytes.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Free space for the next read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes of the spare region as filled.
    pub fn advance(&mut self, n: usize) {
        self.end = (self.end + n).min(self.data.len());
    }

    /// Mark `n` readable bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Copy as much of `src` as fits; returns the number of bytes copied.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.end..self.end + n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }

    /// Move the readable bytes to the front of the buffer.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// Drop all readable bytes.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}
