//! Fixed-capacity object pool.
//!
//! A thread-safe free-list for objects that are expensive to build, such as
//! request line buffers or body buffers. The pool never grows and never
//! blocks: `put` on a full pool drops the object and `get` on an empty pool
//! returns `None`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pool usage counters
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Objects handed out from the pool
    hits: AtomicU64,
    /// `get` calls on an empty pool
    misses: AtomicU64,
    /// Objects accepted back
    returns: AtomicU64,
    /// Objects dropped because the pool was full
    discards: AtomicU64,
}

impl PoolStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Fraction of `get` calls served from the pool
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

/// Stack of reusable objects with a fixed capacity.
#[derive(Debug)]
pub struct ObjectPool<T> {
    slots: Mutex<Vec<T>>,
    capacity: usize,
    stats: PoolStats,
}

impl<T> ObjectPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            stats: PoolStats::default(),
        }
    }

    /// Take an object, or `None` if the pool is empty.
    pub fn get(&self) -> Option<T> {
        let object = self.slots.lock().pop();
        match object {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        object
    }

    /// Take an object or build a fresh one.
    pub fn get_or_else(&self, make: impl FnOnce() -> T) -> T {
        self.get().unwrap_or_else(make)
    }

    /// Return an object. Dropped silently if the pool is already full.
    pub fn put(&self, object: T) {
        let mut slots = self.slots.lock();
        if slots.len() < self.capacity {
            slots.push(object);
            drop(slots);
            self.stats.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(slots);
            self.stats.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of pooled objects
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Drop every pooled object
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
