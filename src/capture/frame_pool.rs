use crate::assets::{POOL_GROW_TOLERANCE_DIVISOR, POOL_MAX_DEPTH, POOL_REUSE_OVERHEAD_DIVISOR};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

/// Tunables for the size-bucket policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Buffers retained per size bucket; extra releases are freed.
    pub max_depth: usize,
    /// A bucket up to `size / grow_tolerance_divisor` bytes larger may serve a request.
    pub grow_tolerance_divisor: usize,
    /// Excess up to `size / reuse_overhead_divisor` is kept instead of truncated.
    pub reuse_overhead_divisor: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_depth: POOL_MAX_DEPTH,
            grow_tolerance_divisor: POOL_GROW_TOLERANCE_DIVISOR,
            reuse_overhead_divisor: POOL_REUSE_OVERHEAD_DIVISOR,
        }
    }
}

/// A byte buffer handed out by a [`BufferPool`].
///
/// `capacity() >= size()`; only the first `size()` bytes belong to the frame.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    size: usize,
}

impl PooledBuffer {
    fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0; size],
            size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers acquired and not yet released.
    pub outstanding: usize,
    pub peak_outstanding: usize,
    /// Fresh allocations since creation or the last reset.
    pub total_created: u64,
}

#[derive(Default)]
struct PoolInner {
    buckets: BTreeMap<usize, Vec<Vec<u8>>>,
    stats: PoolStats,
}

/// Per-stream reuse pool of byte buffers keyed by exact size.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    limits: PoolLimits,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}

impl BufferPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            limits,
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Accounting stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a buffer of at least `size` bytes, allocating when nothing fits.
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        let mut inner = self.lock();
        let buffer = match self.take_pooled(&mut inner, size) {
            Some(buffer) => buffer,
            None => {
                inner.stats.total_created += 1;
                PooledBuffer::zeroed(size)
            }
        };

        inner.stats.outstanding += 1;
        inner.stats.peak_outstanding = inner.stats.peak_outstanding.max(inner.stats.outstanding);
        buffer
    }

    fn take_pooled(&self, inner: &mut PoolInner, size: usize) -> Option<PooledBuffer> {
        if let Some(data) = inner.buckets.get_mut(&size).and_then(Vec::pop) {
            return Some(PooledBuffer { data, size });
        }

        let tolerance = size / self.limits.grow_tolerance_divisor.max(1);
        if tolerance == 0 {
            return None;
        }
        let upper = size.saturating_add(tolerance);
        let bucket_size = inner
            .buckets
            .range(size + 1..=upper)
            .find(|(_, bucket)| !bucket.is_empty())
            .map(|(capacity, _)| *capacity)?;

        let mut data = inner.buckets.get_mut(&bucket_size)?.pop()?;
        let overhead = bucket_size - size;
        if overhead > size / self.limits.reuse_overhead_divisor.max(1) {
            data.truncate(size);
            data.shrink_to_fit();
        }
        Some(PooledBuffer { data, size })
    }

    /// Return a buffer. Freed when its bucket is already full.
    pub fn release(&self, buffer: PooledBuffer) {
        let mut inner = self.lock();
        inner.stats.outstanding = match inner.stats.outstanding.checked_sub(1) {
            Some(outstanding) => outstanding,
            None => unreachable!("buffer released to a pool with no outstanding buffers"),
        };

        let bucket = inner.buckets.entry(buffer.capacity()).or_default();
        if bucket.len() < self.limits.max_depth {
            bucket.push(buffer.data);
        }
    }

    /// Acquire a buffer that returns itself to the pool when dropped.
    pub fn lease(self: &Arc<Self>, size: usize) -> BufferLease {
        BufferLease {
            buffer: Some(self.acquire(size)),
            pool: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }

    /// Number of buffers currently parked in the pool.
    pub fn retained(&self) -> usize {
        self.lock().buckets.values().map(Vec::len).sum()
    }

    /// Clears peak and creation counters; `outstanding` is live state and is kept.
    pub fn reset_stats(&self) {
        let mut inner = self.lock();
        inner.stats.peak_outstanding = inner.stats.outstanding;
        inner.stats.total_created = 0;
    }
}

/// RAII guard for a pooled buffer.
pub struct BufferLease {
    buffer: Option<PooledBuffer>,
    pool: Arc<BufferPool>,
}

impl Deref for BufferLease {
    type Target = PooledBuffer;

    fn deref(&self) -> &PooledBuffer {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("lease accessed after release"),
        }
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut PooledBuffer {
        match &mut self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("lease accessed after release"),
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
