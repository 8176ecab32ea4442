//! Reusable copy buffers.
//!
//! Each copy task leases one fixed-size buffer for its lifetime. The lease
//! hands the buffer back on drop, so it returns to the pool on every exit
//! path, including I/O errors and task abort.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Size of each pooled buffer (matches the usual stream copy chunk).
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of idle buffers retained.
pub const DEFAULT_MAX_POOLED: usize = 256;

struct PoolInner {
    /// Idle buffers. The lock is held only for push/pop, never across I/O.
    idle: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pooled: usize,
    /// Buffers allocated over the pool's lifetime.
    allocated: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A thread-safe pool of fixed-size byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out `buffer_size` buffers and keeping at most
    /// `max_pooled` of them idle.
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_pooled.min(64))),
                buffer_size,
                max_pooled,
                allocated: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool of [`DEFAULT_BUFFER_SIZE`] buffers with a custom retention cap.
    pub fn with_max_pooled(max_pooled: usize) -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, max_pooled)
    }

    /// Lease a buffer, allocating one if none are idle.
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self.inner.idle().pop();
        let buf = match reused {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.buffer_size]
            }
        };

        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    /// Number of buffers allocated since the pool was created.
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_POOLED)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_pooled", &self.inner.max_pooled)
            .field("idle", &self.idle_count())
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// A leased buffer. Returned to its pool when dropped.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.len() != self.pool.buffer_size {
            return;
        }

        let mut idle = self.pool.idle();
        if idle.len() < self.pool.max_pooled {
            idle.push(buf);
        }
    }
}
