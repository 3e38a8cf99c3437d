//! Bounded LRU cache
//!
//! Used for clusters, parsed MFT records and parsed index nodes. Values are
//! cheap clones (usually `Arc` snapshots), so lookups never hand out
//! references into the map.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Slot<V> {
    value: V,
    last_used: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    tick: u64,
    stats: CacheStats,
}

pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// A cache holding at most `capacity` entries; zero disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(capacity.min(1024)),
                tick: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(key) {
            Some(slot) => {
                slot.last_used = tick;
                let value = slot.value.clone();
                inner.stats.hits += 1;
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.map.contains_key(&key) && inner.map.len() >= self.capacity {
            let oldest = inner
                .map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.map.remove(&oldest);
                inner.stats.evictions += 1;
            }
        }
        inner.map.insert(
            key,
            Slot {
                value,
                last_used: tick,
            },
        );
    }

    /// Return the cached value or load, cache and return it. The lock is not
    /// held while `load` runs.
    pub fn get_or_try_insert_with<F>(&self, key: K, load: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = load()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().map.remove(key).map(|slot| slot.value)
    }

    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}
