//! Buffer pool for reusing read/write chunks across connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

use crate::buffer::ByteBuffer;

const POOL_CAPACITY: usize = 128;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Global buffer pool shared by connections that are not given their own.
pub static GLOBAL_BUFFER_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::default()));

/// Process-wide pool of chunk-sized [`ByteBuffer`]s.
///
/// Requests up to `chunk_size` bytes are served from the pool; larger requests
/// get a temporary buffer that is dropped on recycle. Every buffer handed out
/// is counted until it is recycled, so a leak shows up in [`outstanding`](Self::outstanding).
#[derive(Debug)]
pub struct BufferPool {
    chunk_size: usize,
    chunks: ArrayQueue<ByteBuffer>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a new buffer pool holding at most `capacity` idle chunks.
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunks: ArrayQueue::new(capacity.max(1)),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Size of a pooled chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Get a buffer with at least `size` bytes of capacity.
    pub fn allocate(&self, size: usize) -> ByteBuffer {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        if size <= self.chunk_size {
            self.chunks
                .pop()
                .unwrap_or_else(|| ByteBuffer::chunk(self.chunk_size))
        } else {
            ByteBuffer::oversized(size)
        }
    }

    /// Get a chunk-sized buffer.
    pub fn allocate_chunk(&self) -> ByteBuffer {
        self.allocate(self.chunk_size)
    }

    /// Return a buffer to the pool.
    pub fn recycle(&self, mut buffer: ByteBuffer) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if !buffer.is_pooled() || buffer.capacity() != self.chunk_size {
            return;
        }
        buffer.clear();
        // Ignore if pool is full
        let _ = self.chunks.push(buffer);
    }

    /// Make room for a frame of `needed` bytes.
    ///
    /// If the buffer is too small, a larger one is allocated, the readable
    /// bytes are copied forward and the old buffer is recycled. Otherwise the
    /// readable bytes are compacted to the front. Returns `true` when a
    /// replacement buffer was allocated.
    pub fn ensure_capacity(&self, buffer: &mut ByteBuffer, needed: usize) -> bool {
        if buffer.capacity() < needed {
            let mut grown = self.allocate(needed);
            grown.put(buffer.readable());
            let old = std::mem::replace(buffer, grown);
            self.recycle(old);
            true
        } else {
            buffer.compact();
            false
        }
    }

    /// Number of buffers handed out and not yet recycled.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Number of idle chunks in the pool.
    pub fn idle(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_CAPACITY, DEFAULT_CHUNK_SIZE)
    }
}
