//! Capacity-bounded key/value cache with least-recently-used eviction.
//!
//! Backs the memoization of LLM completions. Accesses bump a monotonic clock;
//! when the cache is full, the entry with the smallest stamp is evicted. The
//! scan-based eviction is O(n) but the cache is small and evictions are rare
//! next to the cost of a completion round-trip.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stamp: u64,
}

#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    clock: u64,
    map: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Capacity must be non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            capacity,
            clock: 0,
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.clock += 1;
        let clock = self.clock;
        self.map.get_mut(key).map(|entry| {
            entry.stamp = clock;
            &entry.value
        })
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.clock += 1;
        if let Some(entry) = self.map.get_mut(&key) {
            entry.value = value;
            entry.stamp = self.clock;
            return;
        }
        if self.map.len() >= self.capacity {
            self.evict_oldest();
        }
        let stamp = self.clock;
        self.map.insert(key, Entry { value, stamp });
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .map
            .iter()
            .min_by_key(|(_, entry)| entry.stamp)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.map.remove(&key);
        }
    }
}
