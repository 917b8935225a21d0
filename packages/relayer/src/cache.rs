//! Bounded caches with TTL and max-size eviction.
//!
//! Prevents unbounded memory growth for the per-key sets kept by the watcher,
//! vote submitter and executor under long runtimes or adversarial event
//! volume. Evicting an entry only means a key may be looked at again; every
//! consumer tolerates that because submissions are idempotent on chain.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(86_400); // 24 hours

/// Bounded map with TTL and capacity limits.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are invisible to lookups and purged on insert.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    map: HashMap<K, (V, Instant, u64)>,
    max_size: usize,
    ttl: Duration,
    seq: u64,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
            seq: 0,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map
            .get(key)
            .filter(|(_, t, _)| t.elapsed() < self.ttl)
            .map(|(v, _, _)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace, returning the previous live value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let now = Instant::now();
        let ttl = self.ttl;
        self.map.retain(|_, (_, t, _)| now.duration_since(*t) < ttl);

        if !self.map.contains_key(&key) {
            while self.map.len() >= self.max_size {
                let oldest = self
                    .map
                    .iter()
                    .min_by_key(|(_, (_, _, seq))| *seq)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        self.map.remove(&k);
                    }
                    None => break,
                }
            }
        }

        self.seq += 1;
        self.map.insert(key, (value, now, self.seq)).map(|(v, _, _)| v)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(v, _, _)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Bounded set of keys; a [`BoundedMap`] without values
#[derive(Debug)]
pub struct BoundedSet<K> {
    inner: BoundedMap<K, ()>,
}

impl<K: Eq + Hash + Clone> BoundedSet<K> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: BoundedMap::new(max_size, ttl),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns true if the key was not already present
    pub fn insert(&mut self, key: K) -> bool {
        self.inner.insert(key, ()).is_none()
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for BoundedSet<K> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_insert_and_contains() {
        let mut cache = BoundedSet::new(10, Duration::from_secs(3600));
        assert!(!cache.contains(&1u64));
        assert!(cache.insert(1u64));
        assert!(!cache.insert(1u64));
        assert!(cache.contains(&1u64));
        assert!(cache.remove(&1u64));
        assert!(!cache.contains(&1u64));
    }

    #[test]
    fn test_set_evicts_oldest() {
        let mut cache = BoundedSet::new(3, Duration::from_secs(3600));
        cache.insert(1u64);
        cache.insert(2u64);
        cache.insert(3u64);
        cache.insert(4u64);
        assert!(!cache.contains(&1u64));
        assert!(cache.contains(&4u64));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_map_replace_does_not_evict() {
        let mut cache = BoundedMap::new(2, Duration::from_secs(3600));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.insert("a", 3), Some(1));
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"a"), Some(&3));
        cache.insert("c", 4);
        assert!(cache.get(&"b").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let mut cache = BoundedMap::new(10, Duration::ZERO);
        cache.insert(1u8, "x");
        assert!(cache.get(&1).is_none());
    }
}
