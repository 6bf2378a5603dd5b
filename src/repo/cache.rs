use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Clone)]
struct Entry<V> {
    value: V,
    fetched_at: Instant,
}

enum Slot<V> {
    Ready(Entry<V>),
    /// A fetch for this key is already in flight; `notify` is signaled
    /// when it completes so coalesced callers can re-check the map
    /// instead of issuing their own network call (spec §5: "concurrent
    /// refreshes of the same key MUST coalesce").
    InFlight(Arc<tokio::sync::Notify>),
}

/// TTL-based, single-inflight-per-key cache backing C1's three lookups
/// (branches/tags, Dockerfile listings, service analyses). One instance
/// per lookup kind; keys are whatever tuple that lookup is keyed on in
/// spec §3 ("Cache entries").
pub struct TtlCache<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch `key`, serving a fresh cached value if present and within
    /// TTL, coalescing concurrent misses onto a single call to `fetch`,
    /// and never caching a failed fetch (spec §4.1: "failures are not
    /// cached").
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, force: bool, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        loop {
            let notify = {
                let mut slots = self.slots.lock().await;
                if !force {
                    if let Some(Slot::Ready(entry)) = slots.get(&key) {
                        if entry.fetched_at.elapsed() < self.ttl {
                            return Ok(entry.value.clone());
                        }
                    }
                }
                match slots.get(&key) {
                    Some(Slot::InFlight(notify)) => Some(notify.clone()),
                    _ => {
                        slots.insert(key.clone(), Slot::InFlight(Arc::new(tokio::sync::Notify::new())));
                        None
                    }
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                continue;
            }

            let result = fetch().await;
            let mut slots = self.slots.lock().await;
            let previous = slots.remove(&key);
            match &result {
                Ok(value) => {
                    slots.insert(
                        key.clone(),
                        Slot::Ready(Entry {
                            value: value.clone(),
                            fetched_at: Instant::now(),
                        }),
                    );
                }
                Err(_) => {
                    // leave no entry behind: failures are not cached.
                }
            }
            if let Some(Slot::InFlight(notify)) = previous {
                notify.notify_waiters();
            }
            return result;
        }
    }

    pub async fn invalidate(&self, key: &K) {
        self.slots.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn caches_successful_fetch() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let result: Result<u32, String> = cache
                .get_or_fetch("k".to_string(), false, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(result.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_bypasses_cache() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = calls.clone();
        cache
            .get_or_fetch::<_, _, String>("k".to_string(), false, || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();

        let c2 = calls.clone();
        cache
            .get_or_fetch::<_, _, String>("k".to_string(), true, || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        let first: Result<u32, String> = cache
            .get_or_fetch("k".to_string(), false, || async { Err("boom".to_string()) })
            .await;
        assert!(first.is_err());

        let second: Result<u32, String> = cache
            .get_or_fetch("k".to_string(), false, || async { Ok(7) })
            .await;
        assert_eq!(second.unwrap(), 7);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_fetch() {
        let cache: Arc<TtlCache<String, u32>> = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch::<_, _, String>("k".to_string(), false, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(9)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 9);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
