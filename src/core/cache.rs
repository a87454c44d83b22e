//! Process-wide cache of compiled functions keyed by shape.
//!
//! Compilations never share mutable state. The only shared structure is this
//! cache: readers take the read lock, and a missing entry is compiled outside
//! any lock and inserted only if no other thread won the race.

use hashbrown::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// Insert-if-absent cache guarded by a read/write lock.
pub struct ShapeCache<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K: Eq + Hash + Clone, V> Default for ShapeCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> ShapeCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a compiled entry.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    /// Return the cached entry for `key`, compiling it with `compile` on a miss.
    ///
    /// When two threads miss on the same key both compile, but only the first
    /// insert is kept and both callers observe the same value.
    pub fn get_or_try_insert<E>(
        &self,
        key: &K,
        compile: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let value = Arc::new(compile()?);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.clone()).or_insert(value);
        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_if_absent() {
        let cache: ShapeCache<&'static str, u32> = ShapeCache::new();
        let a = cache.get_or_try_insert::<()>(&"a", || Ok(1)).unwrap();
        let b = cache.get_or_try_insert::<()>(&"a", || Ok(2)).unwrap();
        assert_eq!(*a, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_compile_is_not_cached() {
        let cache: ShapeCache<u32, u32> = ShapeCache::new();
        assert!(cache.get_or_try_insert(&7, || Err("boom")).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_population() {
        let cache: Arc<ShapeCache<u32, u64>> = Arc::new(ShapeCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    *cache
                        .get_or_try_insert::<()>(&1, || Ok(100 + i))
                        .unwrap()
                })
            })
            .collect();
        let seen: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.len(), 1);
    }
}
