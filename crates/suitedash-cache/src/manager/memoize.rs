//! Read-through memoization on top of [`CacheManager`].
//!
//! `try_cached` / `cached` wrap a single computation; [`Memoized`] wraps a
//! reusable operation together with its key builder and tier. Both come in
//! a non-blocking and a blocking flavour with the same cache semantics.
//!
//! Errors from the wrapped operation are returned untouched and never
//! cached. Cache failures only ever turn into a recomputation.

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::CacheManager;
use super::keys::memo_key;
use super::ttl::TtlTier;

/// Per-key locks serializing concurrent non-blocking misses.
///
/// The lock guards a flag set by a holder that could not publish its result
/// (compute error or failed store write). Followers seeing it compute on
/// their own instead of queueing behind each other.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    inflight: Arc<DashMap<String, Arc<Mutex<bool>>>>,
}

pub(crate) struct FlightGuard {
    key: String,
    inflight: Arc<DashMap<String, Arc<Mutex<bool>>>>,
    guard: Option<OwnedMutexGuard<bool>>,
}

impl FlightGuard {
    fn unpublished(&self) -> bool {
        self.guard.as_deref().copied().unwrap_or(false)
    }

    fn mark_unpublished(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            **guard = true;
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still holds the lock: nobody is waiting on this key.
        self.inflight
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SingleFlight {
    /// Acquire the key's flight lock, waiting at most `wait` while another
    /// task holds it. `None` means the wait ran out.
    pub(crate) async fn acquire(&self, key: &str, wait: Duration) -> Option<FlightGuard> {
        let lock = Arc::clone(
            &self
                .inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(false))),
        );
        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(key = %key, "waiting for in-flight computation");
                match tokio::time::timeout(wait, lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        tracing::debug!(key = %key, "in-flight wait timed out, computing directly");
                        return None;
                    }
                }
            }
        };
        Some(FlightGuard {
            key: key.to_string(),
            inflight: Arc::clone(&self.inflight),
            guard: Some(guard),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.inflight.len()
    }
}

/// How a [`Memoized`] operation derives its cache key.
pub enum KeyBuilder<A> {
    /// Caller-supplied key function, usually one of the builders in
    /// [`keys`](super::keys).
    Explicit(Arc<dyn Fn(&A) -> String + Send + Sync>),
    /// `memo:<name>:<hash of the arguments>`.
    Hashed(String),
}

impl<A> Clone for KeyBuilder<A> {
    fn clone(&self) -> Self {
        match self {
            KeyBuilder::Explicit(f) => KeyBuilder::Explicit(Arc::clone(f)),
            KeyBuilder::Hashed(name) => KeyBuilder::Hashed(name.clone()),
        }
    }
}

/// A value-producing operation wrapped with read-through caching.
pub struct Memoized<A, F> {
    manager: CacheManager,
    tier: TtlTier,
    keys: KeyBuilder<A>,
    op: F,
}

impl<A: Serialize, F> Memoized<A, F> {
    /// Cache key for the given arguments, or `None` if they cannot be
    /// encoded (the call then bypasses the cache).
    pub fn key_for(&self, args: &A) -> Option<String> {
        match &self.keys {
            KeyBuilder::Explicit(build) => Some(build(args)),
            KeyBuilder::Hashed(name) => match memo_key(name, args) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "cannot hash memoized arguments, bypassing cache");
                    None
                }
            },
        }
    }

    pub async fn try_call<T, E, Fut>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
    {
        match self.key_for(&args) {
            Some(key) => {
                self.manager
                    .try_cached(&key, self.tier, || (self.op)(args))
                    .await
            }
            None => (self.op)(args).await,
        }
    }

    pub async fn call<T, Fut>(&self, args: A) -> T
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = T>,
        T: Serialize + DeserializeOwned,
    {
        match self.key_for(&args) {
            Some(key) => self.manager.cached(&key, self.tier, || (self.op)(args)).await,
            None => (self.op)(args).await,
        }
    }

    pub fn try_call_blocking<T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Result<T, E>,
        T: Serialize + DeserializeOwned,
    {
        match self.key_for(&args) {
            Some(key) => self
                .manager
                .try_cached_blocking(&key, self.tier, || (self.op)(args)),
            None => (self.op)(args),
        }
    }

    pub fn call_blocking<T>(&self, args: A) -> T
    where
        F: Fn(A) -> T,
        T: Serialize + DeserializeOwned,
    {
        match self.key_for(&args) {
            Some(key) => self
                .manager
                .cached_blocking(&key, self.tier, || (self.op)(args)),
            None => (self.op)(args),
        }
    }
}

impl CacheManager {
    /// Return the cached value for `key`, or run `compute`, store its `Ok`
    /// value under the tier's TTL and return it.
    ///
    /// With single-flight enabled, concurrent misses on the same key wait
    /// for the first computation and then read its result from the cache.
    /// A follower waits at most the store timeout, and stops waiting
    /// altogether once a holder failed to publish a value.
    pub async fn try_cached<T, E, F, Fut>(&self, key: &str, tier: TtlTier, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.store.get::<T>(key).await {
            return Ok(hit);
        }

        let mut flight = match &self.flights {
            Some(flights) => match flights.acquire(key, self.store.timeout()).await {
                Some(guard) if guard.unpublished() => None,
                Some(guard) => {
                    // Another task may have stored the value while we waited.
                    if let Some(hit) = self.store.peek::<T>(key).await {
                        return Ok(hit);
                    }
                    Some(guard)
                }
                None => None,
            },
            None => None,
        };

        let result = compute().await;
        let published = match &result {
            Ok(value) => self.store.set(key, value, Some(self.ttl(tier))).await,
            Err(_) => false,
        };
        if !published {
            if let Some(guard) = flight.as_mut() {
                guard.mark_unpublished();
            }
        }
        result
    }

    pub async fn cached<T, F, Fut>(&self, key: &str, tier: TtlTier, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let result = self
            .try_cached(key, tier, || async move { Ok::<T, Infallible>(compute().await) })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Blocking counterpart of [`try_cached`](Self::try_cached). Concurrent
    /// blocking misses each compute independently.
    pub fn try_cached_blocking<T, E, F>(&self, key: &str, tier: TtlTier, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(hit) = self.blocking.get::<T>(key) {
            return Ok(hit);
        }
        let value = compute()?;
        self.blocking.set(key, &value, Some(self.ttl(tier)));
        Ok(value)
    }

    pub fn cached_blocking<T, F>(&self, key: &str, tier: TtlTier, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        match self.try_cached_blocking(key, tier, || Ok::<T, Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Wrap `op` so results are cached under `memo:<name>:<args hash>`.
    pub fn memoize<A, F>(&self, name: impl Into<String>, tier: TtlTier, op: F) -> Memoized<A, F> {
        Memoized {
            manager: self.clone(),
            tier,
            keys: KeyBuilder::Hashed(name.into()),
            op,
        }
    }

    /// Wrap `op` with an explicit key builder.
    pub fn memoize_with<A, F, K>(&self, key_builder: K, tier: TtlTier, op: F) -> Memoized<A, F>
    where
        K: Fn(&A) -> String + Send + Sync + 'static,
    {
        Memoized {
            manager: self.clone(),
            tier,
            keys: KeyBuilder::Explicit(Arc::new(key_builder)),
            op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::manager::keys::{EntityKind, entity_key};
    use crate::store::{StoreClient, StoreOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> CacheManager {
        let store = StoreClient::new_local(StoreOptions::default());
        CacheManager::from_settings(store, &CacheSettings::default())
    }

    #[tokio::test]
    async fn test_cached_computes_once() {
        let cache = manager();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .cached("dashboard:stats", TtlTier::Short, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    serde_json::json!({"passed": 10, "failed": 2})
                })
                .await;
            assert_eq!(value["passed"], 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = manager();
        let first: Result<u32, String> = cache
            .try_cached("suite:1", TtlTier::Long, || async { Err("db down".to_string()) })
            .await;
        assert_eq!(first, Err("db down".to_string()));
        assert!(!cache.store().exists("suite:1").await);

        let second: Result<u32, String> = cache
            .try_cached("suite:1", TtlTier::Long, || async { Ok(5) })
            .await;
        assert_eq!(second, Ok(5));
        assert_eq!(cache.store().get::<u32>("suite:1").await, Some(5));
    }

    #[tokio::test]
    async fn test_entry_uses_tier_ttl() {
        let cache = manager();
        cache
            .cached("dashboard:stats", TtlTier::Short, || async { 1u8 })
            .await;
        match cache.store().ttl("dashboard:stats").await {
            crate::store::KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(60)),
            other => panic!("unexpected ttl: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let cache = manager();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .cached("suites:list:skip:0:limit:10", TtlTier::Medium, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        vec![1u32, 2, 3]
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.inflight_keys(), 0);
    }

    /// Serializes fine as far as callers care, but never encodes for storage.
    #[derive(Debug, Clone, PartialEq, serde::Deserialize)]
    struct Unstorable(u32);

    impl Serialize for Unstorable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not storable"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_store_does_not_serialize_followers() {
        let cache = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = std::time::Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .cached("dashboard:stats", TtlTier::Short, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Unstorable(7)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Unstorable(7));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() < Duration::from_millis(350));
        assert_eq!(cache.inflight_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_follower_wait_is_bounded_by_store_timeout() {
        let store = StoreClient::new_local(StoreOptions {
            timeout: Duration::from_millis(50),
            ..StoreOptions::default()
        });
        let cache = CacheManager::from_settings(store, &CacheSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = |cache: CacheManager, calls: Arc<AtomicUsize>| async move {
            cache
                .cached("suite:1", TtlTier::Long, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    1u32
                })
                .await
        };
        let leader = tokio::spawn(slow(cache.clone(), Arc::clone(&calls)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = tokio::spawn(slow(cache.clone(), Arc::clone(&calls)));

        assert_eq!(leader.await.unwrap(), 1);
        assert_eq!(follower.await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_compute_error_releases_followers() {
        let cache = manager();
        let first: Result<u32, &str> = cache
            .try_cached("suite:9", TtlTier::Long, || async { Err("db down") })
            .await;
        assert_eq!(first, Err("db down"));
        assert_eq!(cache.inflight_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_without_single_flight_converge() {
        let cache = manager().with_single_flight(false);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .cached("suites:list:skip:0:limit:10", TtlTier::Medium, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        "same".to_string()
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "same");
        }
        assert_eq!(
            cache.store().get::<String>("suites:list:skip:0:limit:10").await.as_deref(),
            Some("same")
        );
    }

    #[tokio::test]
    async fn test_memoized_hashes_arguments() {
        let cache = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let summary = cache.memoize("suite_summary", TtlTier::Medium, move |(suite, window): (u64, String)| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                format!("{suite}/{window}")
            }
        });

        assert_eq!(summary.call((1, "7d".to_string())).await, "1/7d");
        assert_eq!(summary.call((1, "7d".to_string())).await, "1/7d");
        assert_eq!(summary.call((2, "7d".to_string())).await, "2/7d");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let key = summary.key_for(&(1, "7d".to_string())).unwrap();
        assert!(key.starts_with("memo:suite_summary:"));
    }

    #[tokio::test]
    async fn test_memoized_with_explicit_key() {
        let cache = manager();
        let load_suite = cache.memoize_with(
            |id: &u64| entity_key(EntityKind::Suite, id),
            TtlTier::Long,
            |id: u64| async move { Ok::<_, String>(serde_json::json!({"id": id})) },
        );
        assert!(load_suite.try_call(42).await.is_ok());
        assert!(cache.store().exists("suite:42").await);
    }

    #[test]
    fn test_memoized_blocking() {
        let cache = manager();
        let calls = AtomicUsize::new(0);
        let square = cache.memoize("square", TtlTier::Extended, |n: u64| {
            calls.fetch_add(1, Ordering::SeqCst);
            n * n
        });
        assert_eq!(square.call_blocking(9), 81);
        assert_eq!(square.call_blocking(9), 81);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let failing = cache.memoize("failing", TtlTier::Short, |_: u64| Err::<u64, &str>("nope"));
        assert_eq!(failing.try_call_blocking(1), Err("nope"));
    }
}
