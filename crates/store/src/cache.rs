//! Single-flight TTL cache.
//!
//! Entries hold a shared async cell rather than a value, so concurrent
//! callers for the same key await one load instead of racing the
//! database. Failed loads leave the cell empty and are retried by the
//! next caller; stale entries are replaced wholesale.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

struct Entry<V> {
    inserted_at: Instant,
    cell: Arc<OnceCell<V>>,
}

pub struct SingleFlightCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> SingleFlightCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Resolve the cached value, loading it through `init` when absent or
    /// stale. Only one caller runs `init` per entry; the rest await it.
    pub async fn get_or_try_init<E, F, Fut>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: core::future::Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => Arc::clone(&entry.cell),
                _ => {
                    let cell = Arc::new(OnceCell::new());
                    entries.put(
                        key,
                        Entry {
                            inserted_at: Instant::now(),
                            cell: Arc::clone(&cell),
                        },
                    );
                    cell
                }
            }
        };
        cell.get_or_try_init(init).await.map(Clone::clone)
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_loader(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn() -> core::future::Ready<Result<usize, ()>> + '_ {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            core::future::ready(Ok(n))
        }
    }

    #[tokio::test]
    async fn value_is_loaded_once_within_ttl() {
        let cache = SingleFlightCache::new(8, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let first = cache.get_or_try_init(1u32, counter_loader(&calls)).await;
        let second = cache.get_or_try_init(1u32, counter_loader(&calls)).await;
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_load() {
        let cache = Arc::new(SingleFlightCache::new(8, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_init(7u32, || async move {
                        tokio::task::yield_now().await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ()>(42usize)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entries_reload() {
        let cache = SingleFlightCache::new(8, Duration::from_millis(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = cache.get_or_try_init(1u32, counter_loader(&calls)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = cache.get_or_try_init(1u32, counter_loader(&calls)).await;
        assert_eq!(second, Ok(2));
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = SingleFlightCache::new(8, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = cache.get_or_try_init(1u32, counter_loader(&calls)).await;
        cache.invalidate(&1u32);
        let second = cache.get_or_try_init(1u32, counter_loader(&calls)).await;
        assert_eq!(second, Ok(2));
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache: SingleFlightCache<u32, usize> =
            SingleFlightCache::new(8, Duration::from_secs(60));
        let failed: Result<usize, &str> = cache
            .get_or_try_init(1u32, || core::future::ready(Err("boom")))
            .await;
        assert_eq!(failed, Err("boom"));
        let ok: Result<usize, &str> = cache
            .get_or_try_init(1u32, || core::future::ready(Ok(9)))
            .await;
        assert_eq!(ok, Ok(9));
    }
}
