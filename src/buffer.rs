//! Per-worker buffer allocation.
//!
//! Codecs obtain outbound buffers through the `Allocator` trait. The
//! default `BufferPool` keeps a LIFO free list of pre-sized `BytesMut`
//! buffers so the encode path avoids per-operation malloc; buffers grow on
//! demand when a frame is larger than the pool's buffer size.

use bytes::BytesMut;
use std::io;

/// Source of growable byte buffers.
pub trait Allocator {
    /// Allocate an empty buffer with at least `min_capacity` bytes of room.
    ///
    /// Fails with `io::ErrorKind::OutOfMemory` when the allocator is
    /// exhausted.
    fn allocate(&mut self, min_capacity: usize) -> io::Result<BytesMut>;

    /// Return a buffer once its contents have been written out.
    fn release(&mut self, buf: BytesMut);
}

/// Unbounded allocator backed by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&mut self, min_capacity: usize) -> io::Result<BytesMut> {
        Ok(BytesMut::with_capacity(min_capacity))
    }

    fn release(&mut self, _buf: BytesMut) {}
}

/// Per-worker buffer pool with a bounded number of outstanding buffers.
///
/// Buffers are pre-allocated and reused to avoid allocation overhead on the
/// hot path.
#[derive(Debug)]
pub struct BufferPool {
    /// Stack of idle buffers (LIFO for cache locality).
    free_list: Vec<BytesMut>,
    /// Maximum buffers handed out at once.
    count: usize,
    /// Buffers currently handed out.
    outstanding: usize,
    /// Initial size of each buffer.
    buffer_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate (and the outstanding limit)
    /// * `size` - Initial capacity of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let free_list = (0..count).map(|_| BytesMut::with_capacity(size)).collect();
        Self {
            free_list,
            count,
            outstanding: 0,
            buffer_size: size,
        }
    }

    /// Get the initial size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the total number of buffers.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Get the number of buffers that can still be allocated.
    pub fn available(&self) -> usize {
        self.count - self.outstanding
    }
}

impl Allocator for BufferPool {
    fn allocate(&mut self, min_capacity: usize) -> io::Result<BytesMut> {
        if self.outstanding >= self.count {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "buffer pool exhausted",
            ));
        }
        let mut buf = self
            .free_list
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        buf.reserve(min_capacity);
        self.outstanding += 1;
        Ok(buf)
    }

    fn release(&mut self, mut buf: BytesMut) {
        debug_assert!(self.outstanding > 0, "release without allocate");
        self.outstanding = self.outstanding.saturating_sub(1);
        buf.clear();
        if self.free_list.len() < self.count {
            self.free_list.push(buf);
        }
    }
}
