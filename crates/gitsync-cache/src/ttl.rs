//! Short-lived memoization of expensive lookups.
//!
//! Used for remote ref listings so that one build does not ask the remote for
//! the same advertisement several times in a row. Concurrent first requests
//! for one key block on a per-key slot while the value is computed; other keys
//! are unaffected.

use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default TTL for cached entries (1 minute).
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

struct Entry<V> {
    cached_at: Instant,
    value: V,
}

type Slot<V> = Arc<Mutex<Option<Entry<V>>>>;

/// A keyed cache whose entries expire after `ttl`.
pub struct TtlCache<K, V> {
    slots: DashMap<K, Slot<V>>,
    ttl: Duration,
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a new cache with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create a new cache with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached value for `key`, if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Returns the cached value or computes, stores and returns a fresh one.
    ///
    /// Errors are not cached.
    pub fn get_or_try_insert_with<E, F>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = Arc::clone(self.slots.entry(key).or_default().value());
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = guard.as_ref() {
            if entry.cached_at.elapsed() < self.ttl {
                return Ok(entry.value.clone());
            }
        }

        let value = compute()?;
        *guard = Some(Entry {
            cached_at: Instant::now(),
            value: value.clone(),
        });
        Ok(value)
    }

    /// Forgets `key`.
    pub fn invalidate(&self, key: &K) {
        self.slots.remove(key);
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard
                .as_ref()
                .is_some_and(|entry| entry.cached_at.elapsed() < ttl),
            // Being computed right now.
            Err(_) => true,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_get_returns_none_for_missing() {
        let cache: TtlCache<String, u32> = TtlCache::new();
        assert!(cache.get(&"missing".to_string()).is_none());
    }

    #[test]
    fn test_value_is_memoized() {
        let cache = TtlCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with("k", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"k"), Some(7));
    }

    #[test]
    fn test_entries_expire() {
        let cache = TtlCache::with_ttl(Duration::from_millis(10));
        cache.get_or_try_insert_with("k", || Ok::<_, ()>(1)).unwrap();
        assert_eq!(cache.get(&"k"), Some(1));

        thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&"k").is_none());

        let value = cache.get_or_try_insert_with("k", || Ok::<_, ()>(2)).unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache: TtlCache<&str, u32> = TtlCache::new();
        let err = cache.get_or_try_insert_with("k", || Err("offline"));
        assert_eq!(err, Err("offline"));
        let ok = cache.get_or_try_insert_with("k", || Ok::<_, &str>(3));
        assert_eq!(ok, Ok(3));
    }

    #[test]
    fn test_concurrent_first_requests_compute_once() {
        let cache = Arc::new(TtlCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache
                        .get_or_try_insert_with("refs", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok::<_, ()>(vec!["main".to_string()])
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec!["main".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purge_and_invalidate() {
        let cache = TtlCache::with_ttl(Duration::from_millis(10));
        cache.get_or_try_insert_with("a", || Ok::<_, ()>(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        cache.get_or_try_insert_with("b", || Ok::<_, ()>(2)).unwrap();

        cache.purge_expired();
        assert_eq!(cache.len(), 1);

        cache.invalidate(&"b");
        assert!(cache.is_empty());
    }
}
