//! Injectable key/value caches.
//!
//! Long-lived components keep small pieces of shared mutable state: the
//! transcoder remembers which hardware encoders passed their probe, the
//! orchestrator remembers the statistics of each video's last run. Both are
//! held behind the [`Cache`] trait so tests can inject their own instance,
//! inspect it, and reset it deterministically.

use std::hash::Hash;

use dashmap::DashMap;

/// A concurrent key/value cache.
pub trait Cache<K, V>: Send + Sync {
    /// Return a clone of the cached value for `key`.
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or replace the value for `key`.
    fn insert(&self, key: K, value: V);

    /// Remove and return the value for `key`.
    fn remove(&self, key: &K) -> Option<V>;

    /// Drop every entry.
    fn clear(&self);

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the cache holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process [`Cache`] backed by a [`DashMap`]. Contents are lost on restart.
#[derive(Debug)]
pub struct MemoryCache<K: Eq + Hash, V> {
    entries: DashMap<K, V>,
}

impl<K: Eq + Hash, V> MemoryCache<K, V> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> Default for MemoryCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn insert(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_get_remove() {
        let cache: MemoryCache<String, u32> = MemoryCache::new();
        assert!(cache.is_empty());

        cache.insert("a".into(), 1);
        cache.insert("a".into(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some(2));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.remove(&"a".to_string()), Some(2));
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn clear_empties_cache() {
        let cache: MemoryCache<u8, u8> = MemoryCache::default();
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn usable_as_trait_object() {
        let cache: Arc<dyn Cache<String, bool>> = Arc::new(MemoryCache::<String, bool>::new());
        cache.insert("hevc_nvenc".into(), false);
        assert_eq!(cache.get(&"hevc_nvenc".to_string()), Some(false));
    }
}
