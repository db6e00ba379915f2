//! Reusable byte buffers for staging large chunks.

use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of every pooled buffer.
pub const BUFFER_SIZE_BYTES: usize = 1024 * 1024;

/// Fixed set of 1 MiB buffers that grows when exhausted.
///
/// Buffers are allocated on first use and keep their capacity when
/// returned, so steady-state staging does not allocate.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    total: AtomicUsize,
}

/// Counts reported in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Buffers owned by the pool, checked out or not.
    pub total_buffers: usize,
    /// Buffers ready for checkout.
    pub available_buffers: usize,
    /// Capacity of each buffer.
    pub buffer_size_bytes: usize,
}

impl BufferPool {
    /// A pool of `count` buffers.
    pub fn new(count: usize) -> Self {
        Self {
            free: Mutex::new((0..count).map(|_| Vec::new()).collect()),
            total: AtomicUsize::new(count),
        }
    }

    /// Takes a buffer, allocating a new one when none is free.
    pub fn checkout(&self) -> PooledBuffer<'_> {
        let buf = match self.free.lock().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                self.total.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };
        PooledBuffer { pool: self, buf }
    }

    /// Grows the pool to at least `count` buffers. Never shrinks buffers
    /// that are checked out.
    pub fn ensure(&self, count: usize) {
        let mut free = self.free.lock();
        let total = self.total.load(Ordering::Relaxed);
        if count > total {
            free.extend((total..count).map(|_| Vec::new()));
            self.total.store(count, Ordering::Relaxed);
        }
    }

    /// Current counts.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_buffers: self.total.load(Ordering::Relaxed),
            available_buffers: self.free.lock().len(),
            buffer_size_bytes: BUFFER_SIZE_BYTES,
        }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        // Capacity returns to at most one buffer size.
        if buf.capacity() > BUFFER_SIZE_BYTES {
            buf.shrink_to(BUFFER_SIZE_BYTES);
        }
        self.free.lock().push(buf);
    }
}

/// A checked-out buffer. Returns to its pool on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_return() {
        let pool = BufferPool::new(2);
        {
            let mut a = pool.checkout();
            a.extend_from_slice(b"hello");
            assert_eq!(pool.stats().available_buffers, 1);
        }
        let stats = pool.stats();
        assert_eq!(stats.available_buffers, 2);
        assert_eq!(stats.total_buffers, 2);
        assert!(pool.checkout().is_empty());
    }

    #[test]
    fn test_exhaustion_grows() {
        let pool = BufferPool::new(1);
        let a = pool.checkout();
        let b = pool.checkout();
        assert_eq!(pool.stats().total_buffers, 2);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().available_buffers, 2);
    }

    #[test]
    fn test_ensure_only_grows() {
        let pool = BufferPool::new(2);
        pool.ensure(4);
        assert_eq!(pool.stats().total_buffers, 4);
        pool.ensure(1);
        assert_eq!(pool.stats().total_buffers, 4);
        assert_eq!(pool.stats().buffer_size_bytes, BUFFER_SIZE_BYTES);
    }
}
