//! Sliding-expiration snapshot cache for memory-cached tables.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry<T> {
    rows: Arc<Vec<T>>,
    last_access: Instant,
}

/// A full-table snapshot with sliding expiration.
///
/// Writers replace or clear the cache while holding the owning table's
/// lock, so a cached snapshot never disagrees with persisted state.
/// Reads refresh the expiration; a snapshot older than the timeout is
/// dropped and the next read repopulates.
pub struct TableCache<T> {
    entry: Mutex<Option<CacheEntry<T>>>,
    timeout: Duration,
}

impl<T> TableCache<T> {
    /// Creates an empty cache with the given sliding timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            entry: Mutex::new(None),
            timeout,
        }
    }

    /// Returns the cached snapshot if present and fresh, refreshing the
    /// expiration window.
    #[must_use]
    pub fn get(&self) -> Option<Arc<Vec<T>>> {
        let mut entry = self.entry.lock();
        match entry.as_mut() {
            Some(cached) if cached.last_access.elapsed() < self.timeout => {
                cached.last_access = Instant::now();
                Some(Arc::clone(&cached.rows))
            }
            Some(_) => {
                *entry = None;
                None
            }
            None => None,
        }
    }

    /// Replaces the cached snapshot.
    pub fn replace(&self, rows: Arc<Vec<T>>) {
        *self.entry.lock() = Some(CacheEntry {
            rows,
            last_access: Instant::now(),
        });
    }

    /// Drops the cached snapshot.
    pub fn clear(&self) {
        *self.entry.lock() = None;
    }

    /// Returns true if a snapshot is currently held (fresh or not).
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.entry.lock().is_some()
    }
}

impl<T> std::fmt::Debug for TableCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("populated", &self.is_populated())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_cache_misses() {
        let cache: TableCache<i32> = TableCache::new(Duration::from_secs(60));
        assert!(cache.get().is_none());
    }

    #[test]
    fn replace_then_hit() {
        let cache = TableCache::new(Duration::from_secs(60));
        cache.replace(Arc::new(vec![1, 2, 3]));

        let rows = cache.get().unwrap();
        assert_eq!(*rows, vec![1, 2, 3]);
    }

    #[test]
    fn clear_drops_snapshot() {
        let cache = TableCache::new(Duration::from_secs(60));
        cache.replace(Arc::new(vec![1]));
        cache.clear();
        assert!(cache.get().is_none());
    }

    #[test]
    fn expired_entry_is_dropped() {
        let cache = TableCache::new(Duration::from_millis(20));
        cache.replace(Arc::new(vec![1]));

        thread::sleep(Duration::from_millis(40));
        assert!(cache.get().is_none());
        assert!(!cache.is_populated());
    }

    #[test]
    fn access_slides_the_window() {
        let cache = TableCache::new(Duration::from_millis(80));
        cache.replace(Arc::new(vec![1]));

        // Keep touching inside the window; the entry must survive well
        // past the original deadline.
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(40));
            assert!(cache.get().is_some());
        }
    }
}
