//! Preceding-term lookup cache for the heartbeat loop.
//!
//! Computing the preceding term for every follower on every round would
//! hit the log repeatedly for the same indices. The heartbeat loop is the
//! only writer, so a plain LRU without interior locking suffices.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Upper bound on cached index-to-term pairs.
pub const MAX_TERM_CACHE_SIZE: usize = 100;

/// Bounded index-to-term map with per-entry LRU eviction.
#[derive(Debug)]
pub struct PrecedingTermCache {
    entries: LruCache<u64, u64>,
}

impl Default for PrecedingTermCache {
    fn default() -> Self {
        Self::with_capacity(MAX_TERM_CACHE_SIZE)
    }
}

impl PrecedingTermCache {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped above zero");
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(
        &mut self,
        index: u64,
    ) -> Option<u64> {
        self.entries.get(&index).copied()
    }

    pub fn insert(
        &mut self,
        index: u64,
        term: u64,
    ) {
        self.entries.put(index, term);
    }

    /// Drops every cached pair. Called when a snapshot invalidates the
    /// index space.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod term_cache_test {
    use super::*;

    #[test]
    fn test_cache_returns_inserted_terms() {
        let mut cache = PrecedingTermCache::default();
        cache.insert(10, 3);
        assert_eq!(cache.get(10), Some(3));
        assert_eq!(cache.get(11), None);
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let mut cache = PrecedingTermCache::with_capacity(2);
        cache.insert(1, 1);
        cache.insert(2, 1);

        // Touch index 1 so index 2 is the eviction candidate.
        assert_eq!(cache.get(1), Some(1));
        cache.insert(3, 2);

        assert_eq!(cache.get(2), None, "least recently used entry evicted");
        assert_eq!(cache.get(1), Some(1));
        assert_eq!(cache.get(3), Some(2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear_empties_cache() {
        let mut cache = PrecedingTermCache::default();
        cache.insert(5, 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
