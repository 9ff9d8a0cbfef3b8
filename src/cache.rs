//! LRU cache of similarity query results.
//!
//! The cache maps a query [`Vector`] (elementwise equality, bit-pattern
//! hash) to the full top-k list returned for it. Any successful mutation
//! clears the whole cache, so a hit is always computed against the
//! current map state.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;

use crate::error::{Result, VexDBError};
use crate::types::Vector;

/// Cached value: the `(key, distance)` rows of one similarity search.
pub type CachedResults = Vec<(String, f32)>;

/// Bounded LRU cache from query vector to search results.
pub struct QueryCache {
    inner: Mutex<LruCache<Vector, CachedResults>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Counters describing cache effectiveness.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    /// Configured capacity.
    pub capacity: usize,
    /// Entries currently resident.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to recompute.
    pub misses: u64,
    /// Times the cache was cleared by a mutation.
    pub invalidations: u64,
    /// `hits / (hits + misses)`, or 0.0 before any lookup.
    pub hit_rate: f64,
}

impl QueryCache {
    /// Creates a cache holding up to `capacity` query results.
    ///
    /// # Panics
    /// Panics if `capacity` is 0; the facade disables caching instead of
    /// constructing an empty cache.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).expect("query cache capacity must be non-zero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Looks up a query, promoting it to most-recently-used on a hit.
    pub fn get(&self, query: &Vector) -> Result<Option<CachedResults>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| VexDBError::poisoned("query cache"))?;
        match inner.get(query) {
            Some(results) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(results.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Stores results for a query, evicting the least-recently-used entry
    /// when full. An existing entry is updated and promoted.
    pub fn put(&self, query: Vector, results: CachedResults) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| VexDBError::poisoned("query cache"))?;
        inner.put(query, results);
        Ok(())
    }

    /// Empties the cache. Called on every successful mutation.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| VexDBError::poisoned("query cache"))?;
        if inner.len() > 0 {
            inner.clear();
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of entries currently resident.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Returns true if no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            capacity: self.capacity,
            entries: self.len(),
            hits,
            misses,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(xs: &[f32]) -> Vector {
        Vector::from(xs.to_vec())
    }

    fn rows(keys: &[&str]) -> CachedResults {
        keys.iter().map(|k| (k.to_string(), 0.5)).collect()
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = QueryCache::new(4);
        assert!(cache.get(&q(&[1.0])).unwrap().is_none());

        cache.put(q(&[1.0]), rows(&["a"])).unwrap();
        let got = cache.get(&q(&[1.0])).unwrap().unwrap();
        assert_eq!(got[0].0, "a");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = QueryCache::new(2);
        cache.put(q(&[1.0]), rows(&["a"])).unwrap();
        cache.put(q(&[2.0]), rows(&["b"])).unwrap();

        // Touch [1.0] so [2.0] becomes least recently used.
        cache.get(&q(&[1.0])).unwrap();
        cache.put(q(&[3.0]), rows(&["c"])).unwrap();

        assert!(cache.get(&q(&[1.0])).unwrap().is_some());
        assert!(cache.get(&q(&[2.0])).unwrap().is_none());
        assert!(cache.get(&q(&[3.0])).unwrap().is_some());
    }

    #[test]
    fn test_put_existing_updates() {
        let cache = QueryCache::new(2);
        cache.put(q(&[1.0]), rows(&["old"])).unwrap();
        cache.put(q(&[1.0]), rows(&["new"])).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&q(&[1.0])).unwrap().unwrap()[0].0, "new");
    }

    #[test]
    fn test_clear_empties_and_counts() {
        let cache = QueryCache::new(4);
        cache.put(q(&[1.0]), rows(&["a"])).unwrap();
        cache.put(q(&[2.0]), rows(&["b"])).unwrap();
        cache.clear().unwrap();

        assert!(cache.is_empty());
        assert!(cache.get(&q(&[1.0])).unwrap().is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity_panics() {
        let _ = QueryCache::new(0);
    }
}
