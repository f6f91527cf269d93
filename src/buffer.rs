//! Shared buffer pool for relay and short copies.
//!
//! Relay pumps and body copies borrow fixed-size buffers from a process-wide
//! pool instead of allocating per chunk. A [`BufferLease`] returns its buffer
//! on drop, so release happens on every exit path including errors.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Pool of `buffer_size`-byte scratch buffers.
pub struct BufferPool {
    buffer_size: usize,
    max_pooled: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Self::with_capacity(buffer_size, 64)
    }

    pub fn with_capacity(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(512),
            max_pooled,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Size of the buffers handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Borrow a zero-initialised buffer; returned to the pool when dropped.
    pub fn lease(self: &Arc<Self>) -> BufferLease {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        BufferLease {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put_back(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// RAII lease over one pool buffer.
pub struct BufferLease {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("lease already released")
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("lease already released")
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_returns_buffer_on_drop() {
        let pool = BufferPool::new(1024);
        assert_eq!(pool.idle(), 0);
        {
            let mut lease = pool.lease();
            lease[0] = 0xAB;
            assert_eq!(lease.len(), 1024);
        }
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn pool_caps_retained_buffers() {
        let pool = BufferPool::with_capacity(512, 1);
        let a = pool.lease();
        let b = pool.lease();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn minimum_buffer_size_enforced() {
        let pool = BufferPool::new(1);
        assert_eq!(pool.lease().len(), 512);
    }
}
