//! Store client: fail-open primitives over the shared key-value store.
//!
//! ## Backends
//!
//! - **Local**: in-process [`LocalStore`], used when Redis is disabled or
//!   unreachable at startup
//! - **Redis**: `deadpool-redis` pool for the async client, a single guarded
//!   connection for the [`BlockingStoreClient`]
//!
//! ## Failure policy
//!
//! Every store failure (connection, command, timeout, encoding) is logged,
//! counted, and turned into a miss (`get`), `false` (`set`) or `0`
//! (deletes). The cache is an optimization; callers always fall back to
//! computing the value themselves.
//!
//! ## Calling conventions
//!
//! [`StoreClient`] is async; [`StoreClient::blocking`] hands out a
//! [`BlockingStoreClient`] over the same backend. Key namespacing, TTL
//! resolution, value encoding and result accounting go through
//! [`StoreShared`] in both, so the two cannot drift apart.

pub mod blocking;
pub mod codec;
pub mod local;
pub mod pattern;
mod redis_ops;

use deadpool_redis::Pool;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheSettings;
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::stats::{CacheCounters, StatsSnapshot};

pub use blocking::BlockingStoreClient;
pub use local::LocalStore;

/// Keys fetched per `SCAN` round trip and deleted per `DEL` batch.
const SCAN_BATCH: usize = 500;

/// Longest expiry handed to a backend (100 years). Redis rejects `EX`
/// values whose millisecond deadline overflows, so larger TTLs are clamped.
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or has expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Interprets the integer reply of the Redis `TTL` command.
    pub fn from_reply(secs: i64) -> Self {
        match secs {
            -1 => KeyTtl::Persistent,
            s if s >= 0 => KeyTtl::Expires(Duration::from_secs(s as u64)),
            _ => KeyTtl::Missing,
        }
    }
}

/// Memory used by the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub human: String,
}

impl MemoryUsage {
    pub fn from_bytes(used_bytes: u64) -> Self {
        let human = match used_bytes {
            b if b >= 1 << 30 => format!("{:.2}G", b as f64 / (1u64 << 30) as f64),
            b if b >= 1 << 20 => format!("{:.2}M", b as f64 / (1u64 << 20) as f64),
            b if b >= 1 << 10 => format!("{:.2}K", b as f64 / (1u64 << 10) as f64),
            b => format!("{b}B"),
        };
        Self { used_bytes, human }
    }

    /// Parses the reply of `INFO memory`.
    pub fn from_info(info: &str) -> Option<Self> {
        let mut used_bytes = None;
        let mut human = None;
        for line in info.lines() {
            if let Some(v) = line.strip_prefix("used_memory:") {
                used_bytes = v.trim().parse::<u64>().ok();
            } else if let Some(v) = line.strip_prefix("used_memory_human:") {
                human = Some(v.trim().to_string());
            }
        }
        let used_bytes = used_bytes?;
        Some(match human {
            Some(human) => Self { used_bytes, human },
            None => Self::from_bytes(used_bytes),
        })
    }
}

/// Construction options for a [`StoreClient`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Prefix prepended to every key; empty disables namespacing.
    pub namespace: String,
    /// TTL applied when a caller omits one (or passes zero).
    pub default_ttl_secs: u64,
    /// Upper bound for a single store call.
    pub timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

impl StoreOptions {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            default_ttl_secs: settings.categories.default_ttl_secs.max(1),
            timeout: settings.redis.timeout(),
        }
    }
}

#[derive(Clone)]
pub(crate) enum StoreBackend {
    Local(Arc<LocalStore>),
    Redis {
        pool: Pool,
        client: redis::Client,
        blocking: Arc<Mutex<Option<redis::Connection>>>,
    },
}

impl StoreBackend {
    fn name(&self) -> &'static str {
        match self {
            StoreBackend::Local(_) => "local",
            StoreBackend::Redis { .. } => "redis",
        }
    }
}

/// Semantics shared by both calling conventions.
pub(crate) struct StoreShared {
    options: StoreOptions,
    counters: CacheCounters,
}

impl StoreShared {
    fn new(options: StoreOptions) -> Self {
        Self {
            options,
            counters: CacheCounters::default(),
        }
    }

    pub(crate) fn full_key(&self, key: &str) -> String {
        if self.options.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.options.namespace)
        }
    }

    pub(crate) fn full_pattern(&self, pattern: &str) -> String {
        if self.options.namespace.is_empty() {
            pattern.to_string()
        } else {
            format!("{}:{pattern}", pattern::escape_glob(&self.options.namespace))
        }
    }

    /// Zero or a missing TTL means "use the default", never "expire now".
    /// The result is clamped to [`MAX_TTL_SECS`].
    pub(crate) fn resolve_ttl(&self, ttl: Option<u64>) -> u64 {
        let secs = match ttl {
            Some(secs) if secs > 0 => secs,
            _ => self.options.default_ttl_secs,
        };
        secs.min(MAX_TTL_SECS)
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.options.timeout
    }

    pub(crate) fn record_failure(
        &self,
        backend: &'static str,
        op: &'static str,
        key: &str,
        err: &StoreError,
    ) {
        self.counters.record_error();
        metrics::record_store_error(op, err.kind());
        tracing::warn!(
            backend,
            op,
            key = %key,
            error = %err,
            "cache store operation failed, continuing without cache"
        );
    }

    pub(crate) fn finish_get<T>(
        &self,
        backend: &'static str,
        key: &str,
        result: StoreResult<Option<T>>,
    ) -> Option<T> {
        match result {
            Ok(Some(value)) => {
                tracing::debug!(key = %key, backend, "cache hit");
                self.counters.record_hit();
                metrics::record_cache_hit(backend);
                Some(value)
            }
            Ok(None) => {
                tracing::debug!(key = %key, backend, "cache miss");
                self.counters.record_miss();
                metrics::record_cache_miss(backend);
                None
            }
            Err(e) => {
                self.record_failure(backend, "get", key, &e);
                self.counters.record_miss();
                metrics::record_cache_miss(backend);
                None
            }
        }
    }

    pub(crate) fn finish_set(
        &self,
        backend: &'static str,
        key: &str,
        ttl_secs: u64,
        result: StoreResult<()>,
    ) -> bool {
        match result {
            Ok(()) => {
                tracing::debug!(key = %key, ttl_secs, backend, "cache set");
                self.counters.record_set();
                metrics::record_cache_set(backend);
                true
            }
            Err(e) => {
                self.record_failure(backend, "set", key, &e);
                false
            }
        }
    }

    pub(crate) fn finish_delete(
        &self,
        backend: &'static str,
        op: &'static str,
        key: &str,
        result: StoreResult<u64>,
    ) -> u64 {
        match result {
            Ok(removed) => {
                if removed == 0 {
                    tracing::debug!(key = %key, op, "nothing to invalidate");
                } else {
                    tracing::debug!(key = %key, op, removed, "cache invalidated");
                }
                self.counters.record_invalidations(removed);
                metrics::record_cache_invalidations(backend, removed);
                removed
            }
            Err(e) => {
                self.record_failure(backend, op, key, &e);
                0
            }
        }
    }

    pub(crate) fn stats(&self) -> StatsSnapshot {
        self.counters.snapshot()
    }
}

/// Non-blocking store client. Cheap to clone; clones share counters and
/// connections.
#[derive(Clone)]
pub struct StoreClient {
    backend: StoreBackend,
    shared: Arc<StoreShared>,
}

impl StoreClient {
    /// Create a client over a fresh in-process store.
    pub fn new_local(options: StoreOptions) -> Self {
        Self::with_local_store(Arc::new(LocalStore::new()), options)
    }

    /// Create a client over an existing in-process store.
    pub fn with_local_store(store: Arc<LocalStore>, options: StoreOptions) -> Self {
        Self {
            backend: StoreBackend::Local(store),
            shared: Arc::new(StoreShared::new(options)),
        }
    }

    /// Create a Redis-backed client. `client` is used for the blocking
    /// convention; `pool` serves the async one.
    pub fn new_redis(pool: Pool, client: redis::Client, options: StoreOptions) -> Self {
        Self {
            backend: StoreBackend::Redis {
                pool,
                client,
                blocking: Arc::new(Mutex::new(None)),
            },
            shared: Arc::new(StoreShared::new(options)),
        }
    }

    /// Blocking view over the same backend, counters and key namespace.
    pub fn blocking(&self) -> BlockingStoreClient {
        BlockingStoreClient::new(self.backend.clone(), Arc::clone(&self.shared))
    }

    /// "local" or "redis".
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_redis(&self) -> bool {
        matches!(self.backend, StoreBackend::Redis { .. })
    }

    /// The in-process store, when running without Redis.
    pub fn local_store(&self) -> Option<&Arc<LocalStore>> {
        match &self.backend {
            StoreBackend::Local(store) => Some(store),
            StoreBackend::Redis { .. } => None,
        }
    }

    /// Resolve the TTL a `set` with the given argument would use.
    pub fn resolve_ttl(&self, ttl: Option<u64>) -> u64 {
        self.shared.resolve_ttl(ttl)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats()
    }

    /// Upper bound for a single store call.
    pub(crate) fn timeout(&self) -> Duration {
        self.shared.timeout()
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout = self.shared.timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn fetch_bytes(&self, full: &str) -> StoreResult<Option<Vec<u8>>> {
        match &self.backend {
            StoreBackend::Local(store) => Ok(store.get_bytes(full).map(|data| data.to_vec())),
            StoreBackend::Redis { pool, .. } => {
                self.timed("get", redis_ops::get(pool, full)).await
            }
        }
    }

    /// Removes keys (already namespaced) without touching the counters.
    async fn remove_raw(&self, op: &'static str, full_keys: &[String]) -> StoreResult<u64> {
        if full_keys.is_empty() {
            return Ok(0);
        }
        match &self.backend {
            StoreBackend::Local(store) => Ok(store.delete(full_keys)),
            StoreBackend::Redis { pool, .. } => {
                self.timed(op, redis_ops::del(pool, full_keys)).await
            }
        }
    }

    /// Get a value, or `None` on miss or any store failure.
    ///
    /// An entry that cannot be decoded as `T` is dropped from the store.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full = self.shared.full_key(key);
        let result = match self.fetch_bytes(&full).await {
            Ok(Some(data)) => codec::decode::<T>(&data).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        if matches!(result, Err(StoreError::Decode(_))) {
            if let Err(e) = self.remove_raw("get", &[full]).await {
                self.shared.record_failure(self.backend_name(), "get", key, &e);
            }
        }
        self.shared.finish_get(self.backend_name(), key, result)
    }

    /// Like [`get`](Self::get) but leaves the hit/miss counters untouched.
    pub(crate) async fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full = self.shared.full_key(key);
        let result = match self.fetch_bytes(&full).await {
            Ok(Some(data)) => codec::decode::<T>(&data).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            self.shared.record_failure(self.backend_name(), "peek", key, &e);
            None
        })
    }

    /// Serialize and store a value. `ttl` of `None` or `Some(0)` uses the
    /// default TTL. Returns `false` if the value was not stored.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool {
        let ttl_secs = self.shared.resolve_ttl(ttl);
        let result = match codec::encode(value) {
            Ok(data) => {
                let full = self.shared.full_key(key);
                match &self.backend {
                    StoreBackend::Local(store) => {
                        store.set_bytes(&full, data, Duration::from_secs(ttl_secs));
                        Ok(())
                    }
                    StoreBackend::Redis { pool, .. } => {
                        self.timed("set", redis_ops::set_ex(pool, &full, &data, ttl_secs))
                            .await
                    }
                }
            }
            Err(e) => Err(e),
        };
        self.shared.finish_set(self.backend_name(), key, ttl_secs, result)
    }

    /// Delete one key. Returns 1 if it existed, 0 otherwise (including on failure).
    pub async fn delete(&self, key: &str) -> u64 {
        let full = self.shared.full_key(key);
        let result = self.remove_raw("delete", &[full]).await;
        self.shared
            .finish_delete(self.backend_name(), "delete", key, result)
    }

    /// Delete every key matching a glob pattern (e.g. `suites:list:*`).
    ///
    /// Scan-then-delete: a key written while the scan is in flight may
    /// survive this pass. A failing batch is logged and skipped; the return
    /// value counts only keys actually removed.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let full_pattern = self.shared.full_pattern(pattern);
        let keys = match &self.backend {
            StoreBackend::Local(store) => Ok(store.scan(&full_pattern)),
            StoreBackend::Redis { pool, .. } => {
                self.timed("scan", redis_ops::scan(pool, &full_pattern, SCAN_BATCH))
                    .await
            }
        };
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => {
                self.shared
                    .record_failure(self.backend_name(), "delete_by_pattern", pattern, &e);
                return 0;
            }
        };

        let mut removed = 0;
        for chunk in keys.chunks(SCAN_BATCH) {
            let result = self.remove_raw("delete_by_pattern", chunk).await;
            removed += self
                .shared
                .finish_delete(self.backend_name(), "delete_by_pattern", pattern, result);
        }
        if removed > 0 {
            tracing::info!(pattern = %pattern, removed, "pattern invalidation");
        }
        removed
    }

    /// Remove every key under this client's namespace.
    pub async fn flush(&self) -> u64 {
        self.delete_by_pattern("*").await
    }

    pub async fn exists(&self, key: &str) -> bool {
        let full = self.shared.full_key(key);
        let result = match &self.backend {
            StoreBackend::Local(store) => Ok(store.exists(&full)),
            StoreBackend::Redis { pool, .. } => {
                self.timed("exists", redis_ops::exists(pool, &full)).await
            }
        };
        result.unwrap_or_else(|e| {
            self.shared
                .record_failure(self.backend_name(), "exists", key, &e);
            false
        })
    }

    pub async fn ttl(&self, key: &str) -> KeyTtl {
        let full = self.shared.full_key(key);
        let result = match &self.backend {
            StoreBackend::Local(store) => Ok(store.ttl(&full)),
            StoreBackend::Redis { pool, .. } => self
                .timed("ttl", redis_ops::ttl(pool, &full))
                .await
                .map(KeyTtl::from_reply),
        };
        result.unwrap_or_else(|e| {
            self.shared.record_failure(self.backend_name(), "ttl", key, &e);
            KeyTtl::Missing
        })
    }

    /// Add members to a set key and refresh its expiry.
    pub async fn add_to_set(&self, set_key: &str, members: &[String], ttl_secs: u64) -> bool {
        if members.is_empty() {
            return true;
        }
        let full = self.shared.full_key(set_key);
        let ttl_secs = self.shared.resolve_ttl(Some(ttl_secs));
        let result = match &self.backend {
            StoreBackend::Local(store) => {
                store.add_to_set(&full, members, Duration::from_secs(ttl_secs));
                Ok(())
            }
            StoreBackend::Redis { pool, .. } => {
                self.timed("add_to_set", redis_ops::sadd(pool, &full, members, ttl_secs))
                    .await
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.shared
                    .record_failure(self.backend_name(), "add_to_set", set_key, &e);
                false
            }
        }
    }

    pub async fn set_members(&self, set_key: &str) -> Vec<String> {
        let full = self.shared.full_key(set_key);
        let result = match &self.backend {
            StoreBackend::Local(store) => Ok(store.set_members(&full)),
            StoreBackend::Redis { pool, .. } => {
                self.timed("set_members", redis_ops::smembers(pool, &full))
                    .await
            }
        };
        result.unwrap_or_else(|e| {
            self.shared
                .record_failure(self.backend_name(), "set_members", set_key, &e);
            Vec::new()
        })
    }

    pub async fn remove_from_set(&self, set_key: &str, members: &[String]) -> bool {
        if members.is_empty() {
            return true;
        }
        let full = self.shared.full_key(set_key);
        let result = match &self.backend {
            StoreBackend::Local(store) => {
                store.remove_from_set(&full, members);
                Ok(())
            }
            StoreBackend::Redis { pool, .. } => {
                self.timed("remove_from_set", redis_ops::srem(pool, &full, members))
                    .await
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.shared
                    .record_failure(self.backend_name(), "remove_from_set", set_key, &e);
                false
            }
        }
    }

    /// Delete bookkeeping keys (tag sets, dependency records). Not counted
    /// as invalidations.
    pub async fn delete_index(&self, keys: &[String]) -> bool {
        let full: Vec<String> = keys.iter().map(|k| self.shared.full_key(k)).collect();
        match self.remove_raw("delete_index", &full).await {
            Ok(_) => true,
            Err(e) => {
                self.shared.record_failure(
                    self.backend_name(),
                    "delete_index",
                    &keys.join(","),
                    &e,
                );
                false
            }
        }
    }

    /// Liveness check.
    pub async fn ping(&self) -> bool {
        match &self.backend {
            StoreBackend::Local(_) => true,
            StoreBackend::Redis { pool, .. } => {
                match self.timed("ping", redis_ops::ping(pool)).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.shared.record_failure("redis", "ping", "", &e);
                        false
                    }
                }
            }
        }
    }

    pub async fn memory_usage(&self) -> Option<MemoryUsage> {
        match &self.backend {
            StoreBackend::Local(store) => Some(MemoryUsage::from_bytes(store.memory_bytes())),
            StoreBackend::Redis { pool, .. } => {
                match self.timed("memory_usage", redis_ops::info_memory(pool)).await {
                    Ok(info) => MemoryUsage::from_info(&info),
                    Err(e) => {
                        self.shared.record_failure("redis", "memory_usage", "", &e);
                        None
                    }
                }
            }
        }
    }

    /// Release pooled and blocking connections.
    pub fn close(&self) {
        if let StoreBackend::Redis { pool, blocking, .. } = &self.backend {
            pool.close();
            blocking.lock().take();
            tracing::info!("cache store connections closed");
        }
    }
}
