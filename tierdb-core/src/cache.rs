//! Short-lived result cache for the read path

use crate::clock::Clock;
use crate::{Result, Timestamp};
use chrono::Duration;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Entry<V> {
    value: V,
    inserted_at: Timestamp,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// TTL and capacity bounded cache.
///
/// Owned by whoever constructs it; a zero TTL or capacity disables caching.
pub struct ResultCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Bumped by every `clear`, under the entries lock
    generation: AtomicU64,
}

impl<K, V> ResultCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    fn enabled(&self) -> bool {
        self.ttl > Duration::zero() && self.capacity > 0
    }

    /// Cached value for `key` if it has not expired
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.enabled() {
            return None;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let fresh = match entries.get(key) {
            Some(entry) if now - entry.inserted_at < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        fresh
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_if_current(key, value, None);
    }

    /// Insert unless the cache was cleared since `generation` was read
    fn insert_if_current(&self, key: K, value: V, generation: Option<u64>) {
        if !self.enabled() {
            return;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if generation.is_some_and(|g| g != self.generation.load(Ordering::Acquire)) {
            return;
        }

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            entries.retain(|_, e| now - e.inserted_at < self.ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Return the cached value or compute, cache and return it.
    ///
    /// Errors are returned as-is and never cached. A value computed while
    /// the cache was cleared is returned but not stored, since it may
    /// predate whatever the clear was for.
    pub fn get_or_try_insert_with<F>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = compute()?;
        self.insert_if_current(key, value.clone(), Some(generation));
        Ok(value)
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}
