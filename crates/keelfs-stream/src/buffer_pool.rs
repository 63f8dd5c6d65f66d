//! Reusable staging buffers for the codecs' hot read/write paths.
//!
//! A pool is an explicit object: callers create one, clone the handle into every
//! codec that should share it, and drop it when they are done. Buffers are
//! grouped by capacity class and always handed out empty (`len() == 0`), so no
//! bytes from a previous stream can be observed through a reused buffer.
//!
//! A class is the capacity a caller asked for. Buffers go back to the class
//! they were acquired for even if they grew while on loan, so the set of
//! classes never outgrows the set of requested sizes.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Limits for a [`BufferPool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Maximum idle buffers kept per capacity class.
    pub max_per_class: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { max_per_class: 16 }
    }
}

/// Allocation/reuse counters.
#[derive(Debug, Default, Clone)]
pub struct BufferPoolStats {
    /// Buffers freshly allocated.
    pub alloc_count: u64,
    /// Buffers served from the free list.
    pub reuse_count: u64,
    /// Buffers handed back and kept.
    pub return_count: u64,
    /// Buffers handed back and dropped because the class was full.
    pub dropped_count: u64,
}

impl BufferPoolStats {
    /// Fraction of acquisitions served from the free list.
    pub fn hit_rate(&self) -> f64 {
        let total = self.alloc_count + self.reuse_count;
        if total == 0 {
            0.0
        } else {
            self.reuse_count as f64 / total as f64
        }
    }
}

struct PoolInner {
    classes: HashMap<usize, Vec<Vec<u8>>>,
    stats: BufferPoolStats,
    config: BufferPoolConfig,
}

/// Shared free list of byte buffers, keyed by capacity.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferPool")
            .field("classes", &inner.classes.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                classes: HashMap::new(),
                stats: BufferPoolStats::default(),
                config,
            })),
        }
    }

    /// Take an empty buffer with at least `capacity` bytes of capacity.
    pub fn acquire(&self, capacity: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let reused = inner.classes.get_mut(&capacity).and_then(|c| c.pop());
        if let Some(mut buf) = reused {
            inner.stats.reuse_count += 1;
            buf.clear();
            buf
        } else {
            inner.stats.alloc_count += 1;
            debug!(capacity, "buffer_pool: allocated new buffer");
            Vec::with_capacity(capacity)
        }
    }

    /// Hand back a buffer obtained from `acquire(class)`. Buffers smaller
    /// than `class` cannot serve that class and are dropped.
    pub fn release(&self, class: usize, mut buf: Vec<u8>) {
        if class == 0 || buf.capacity() < class {
            return;
        }
        buf.clear();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let max = inner.config.max_per_class;
        let class = inner.classes.entry(class).or_default();
        if class.len() < max {
            class.push(buf);
            inner.stats.return_count += 1;
        } else {
            inner.stats.dropped_count += 1;
        }
    }

    /// Like [`BufferPool::acquire`], but the buffer goes back to the pool when
    /// the guard is dropped.
    pub fn acquire_pooled(&self, capacity: usize) -> PooledBuf {
        PooledBuf {
            buf: self.acquire(capacity),
            class: capacity,
            pool: self.clone(),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BufferPoolStats {
        self.inner.lock().stats.clone()
    }

    /// Idle buffers in one capacity class.
    pub fn available(&self, capacity: usize) -> usize {
        self.inner
            .lock()
            .classes
            .get(&capacity)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuf {
    buf: Vec<u8>,
    class: usize,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(self.class, std::mem::take(&mut self.buf));
    }
}
