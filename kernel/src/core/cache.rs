//! Bounded LRU cache with time-to-live, owned by the component that uses it.

use std::collections::HashMap;
use std::hash::Hash;

use crate::core::clock::SharedClock;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_ms: u64,
    last_used: u64,
}

/// Least-recently-used cache. Entries older than `ttl_ms` are treated as
/// missing; `ttl_ms == 0` disables expiry.
pub struct BoundedCache<K, V> {
    capacity: usize,
    ttl_ms: u64,
    clock: SharedClock,
    tick: u64,
    entries: HashMap<K, Entry<V>>,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize, ttl_ms: u64, clock: SharedClock) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_ms,
            clock,
            tick: 0,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| self.is_expired(entry, now));
        if expired {
            self.entries.remove(key);
        }
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.tick += 1;
        let entry = Entry {
            value,
            inserted_ms: self.clock.now_ms(),
            last_used: self.tick,
        };
        self.entries.insert(key, entry);
    }

    /// Return the cached value or compute, store and return it.
    pub fn get_or_insert_with(&mut self, key: K, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn is_expired(&self, entry: &Entry<V>, now: u64) -> bool {
        self.ttl_ms > 0 && now.saturating_sub(entry.inserted_ms) >= self.ttl_ms
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    #[test]
    fn evicts_least_recently_used() {
        let clock = ManualClock::new(0);
        let mut cache = BoundedCache::new(2, 0, clock);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = ManualClock::new(0);
        let mut cache = BoundedCache::new(4, 100, clock.clone());
        cache.insert("k", "v");
        clock.advance(99);
        assert_eq!(cache.get(&"k"), Some("v"));
        clock.advance(1);
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn get_or_insert_with_computes_once() {
        let clock = ManualClock::new(0);
        let mut cache = BoundedCache::new(4, 0, clock);
        let mut calls = 0;
        for _ in 0..3 {
            let value = cache.get_or_insert_with("k", || {
                calls += 1;
                42
            });
            assert_eq!(value, 42);
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.stats(), (2, 1));
    }
}
