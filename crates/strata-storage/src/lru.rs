//! Generic LRU index
//!
//! Recency is tracked with a logical clock: each access stamps the entry
//! with a fresh tick, and an ordered map from tick to key yields the least
//! recently used entry. The index never evicts on its own; callers decide
//! what may leave via [`LruCache::pop_lru`].

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

struct Entry<V> {
    value: V,
    last_access: u64,
}

/// Hash-indexed map ordered by recency of use
pub struct LruCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    clock: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up `key` and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.touch(key) {
            return None;
        }
        self.entries.get(key).map(|e| &e.value)
    }

    /// Look up `key` without changing its position
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Mark `key` most recently used; false if absent
    pub fn touch(&mut self, key: &K) -> bool {
        let now = self.tick();
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        self.order.remove(&entry.last_access);
        entry.last_access = now;
        self.order.insert(now, key.clone());
        true
    }

    /// Insert as most recently used, returning any previous value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let now = self.tick();
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                value,
                last_access: now,
            },
        );
        if let Some(old) = &previous {
            self.order.remove(&old.last_access);
        }
        self.order.insert(now, key);
        previous.map(|e| e.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.last_access);
        Some(entry.value)
    }

    /// Remove and return the least recently used entry
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        Some((key, entry.value))
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }

    /// Values from least to most recently used
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key).map(|e| &e.value))
    }
}

impl<K, V> Default for LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
