//! Generic object pool with TTL eviction
//!
//! Bounded pool of reusable objects (Web3 clients, HTTP connections,
//! scratch buffers). Entries age from the moment they are released; a
//! background reaper sweeps expired entries every `ttl / 2`, and `get`
//! discards anything stale or failing the optional validation predicate
//! before falling back to the factory.
//!
//! All state mutation sits behind one mutex and never blocks on IO, so
//! `get`/`release` are safe to call from async context.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

/// Factory producing a fresh pooled object.
pub type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Liveness check applied before reuse; `false` discards the entry.
pub type Validator<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct PooledEntry<T> {
    object: T,
    released_at: Instant,
}

/// Pool usage counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub max_size: usize,
    pub available: usize,
    pub in_use: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

pub struct ObjectPool<T: Send + 'static> {
    name: String,
    max_size: usize,
    ttl: Duration,
    factory: Factory<T>,
    validation: Option<Validator<T>>,
    /// LIFO stack of idle entries; most recently released sits at the end.
    available: Mutex<Vec<PooledEntry<T>>>,
    in_use: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new(
        name: impl Into<String>,
        max_size: usize,
        ttl: Duration,
        factory: Factory<T>,
        validation: Option<Validator<T>>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            name: name.into(),
            max_size: max_size.max(1),
            ttl,
            factory,
            validation,
            available: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            reaper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&pool);
        let interval = (ttl / 2).max(Duration::from_millis(50));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else { break };
                let evicted = pool.purge_expired();
                if evicted > 0 {
                    tracing::debug!(pool = %pool.name, evicted, "reaped expired pool entries");
                }
            }
        });
        *pool.reaper.lock() = Some(handle);
        pool
    }

    /// Take an object, reusing the most recently released valid entry or
    /// creating a fresh one.
    pub fn get(&self) -> T {
        let mut available = self.available.lock();
        while let Some(entry) = available.pop() {
            if entry.released_at.elapsed() > self.ttl {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(validate) = &self.validation {
                if !validate(&entry.object) {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            self.reused.fetch_add(1, Ordering::Relaxed);
            self.in_use.fetch_add(1, Ordering::Relaxed);
            return entry.object;
        }
        drop(available);

        self.created.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    /// Return an object to the pool. When full, the single oldest idle
    /// entry is evicted first so the pool never exceeds `max_size`.
    pub fn release(&self, object: T) {
        self.in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .ok();

        let mut available = self.available.lock();
        if available.len() >= self.max_size {
            // Index 0 is the oldest release in the LIFO stack.
            available.remove(0);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
        available.push(PooledEntry {
            object,
            released_at: Instant::now(),
        });
    }

    /// Evict every idle entry older than the TTL. Returns the count.
    pub fn purge_expired(&self) -> usize {
        let mut available = self.available.lock();
        let before = available.len();
        available.retain(|e| e.released_at.elapsed() <= self.ttl);
        let evicted = before - available.len();
        self.discarded.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Drop every idle entry regardless of age (memory-pressure path).
    pub fn purge_all(&self) -> usize {
        let mut available = self.available.lock();
        let evicted = available.len();
        available.clear();
        self.discarded.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            max_size: self.max_size,
            available: self.available.lock().len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop the reaper and drop all idle entries.
    pub fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        self.available.lock().clear();
    }
}

impl<T: Send + 'static> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}
