//! Reusable byte buffers for the frame read/write path.
//!
//! Buffers are bucketed by power-of-two size class. [`BufferPool::take`] hands
//! out a [`PooledBuffer`] guard which returns its storage to the pool on drop,
//! so a buffer taken on a path that later fails is still recycled.
//!
//! The send path and the receive path take and return concurrently; buckets
//! live in a `DashMap` so neither side blocks the other on a global lock.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

/// Smallest size class handed out. Length prefixes land here.
const MIN_CLASS: usize = 64;

/// Buffers above this class are freed instead of pooled.
const MAX_POOLED_CLASS: usize = 1024 * 1024;

pub struct BufferPool {
    buckets: DashMap<usize, Vec<Vec<u8>>>,
    max_per_bucket: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub const DEFAULT_MAX_PER_BUCKET: usize = 8;

    pub fn new() -> Arc<Self> {
        Self::with_max_per_bucket(Self::DEFAULT_MAX_PER_BUCKET)
    }

    pub fn with_max_per_bucket(max_per_bucket: usize) -> Arc<Self> {
        Arc::new(Self {
            buckets: DashMap::new(),
            max_per_bucket,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Take a buffer of exactly `size` visible bytes.
    ///
    /// Contents are unspecified (a recycled buffer keeps its old bytes); callers
    /// overwrite before reading.
    pub fn take(self: &Arc<Self>, size: usize) -> PooledBuffer {
        let class = size_class(size);
        let recycled = self
            .buckets
            .get_mut(&class)
            .and_then(|mut bucket| bucket.pop());

        let storage = recycled.unwrap_or_else(|| vec![0u8; class]);
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            storage: Some(storage),
            len: size,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of idle buffers held for reuse.
    pub fn pooled(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    fn give_back(&self, storage: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let class = storage.len();
        if class > MAX_POOLED_CLASS {
            return;
        }

        let mut bucket = self.buckets.entry(class).or_default();
        if bucket.len() < self.max_per_bucket {
            bucket.push(storage);
        }
    }
}

fn size_class(size: usize) -> usize {
    size.max(MIN_CLASS).next_power_of_two()
}

/// A buffer on loan from a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuffer {
    storage: Option<Vec<u8>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the visible bytes into an owned `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.deref().to_vec()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.storage {
            Some(ref storage) => &storage[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.storage {
            Some(ref mut storage) => &mut storage[..self.len],
            None => &mut [],
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.give_back(storage);
        }
    }
}
