//! Blocking calling convention for background work outside the async runtime.
//!
//! Shares backend, namespace, TTL policy, encoding and counters with the
//! [`StoreClient`](super::StoreClient) it was created from. With Redis, a
//! single connection is opened lazily, guarded by a mutex, and discarded
//! after an I/O or timeout failure so the next call reconnects.

use parking_lot::Mutex;
use redis::Commands;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;

use super::{KeyTtl, MemoryUsage, SCAN_BATCH, StoreBackend, StoreShared, codec};
use crate::error::{StoreError, StoreResult};
use crate::stats::StatsSnapshot;

#[derive(Clone)]
pub struct BlockingStoreClient {
    backend: StoreBackend,
    shared: Arc<StoreShared>,
}

impl BlockingStoreClient {
    pub(crate) fn new(backend: StoreBackend, shared: Arc<StoreShared>) -> Self {
        Self { backend, shared }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats()
    }

    fn with_conn<T>(
        &self,
        client: &redis::Client,
        slot: &Mutex<Option<redis::Connection>>,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> StoreResult<T> {
        let timeout = self.shared.timeout();
        let mut guard = slot.lock();
        if guard.is_none() {
            *guard = Some(open_connection(client, timeout)?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::connect("blocking connection unavailable"));
        };
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_unrecoverable_error() || e.is_timeout() {
                    *guard = None;
                }
                Err(e.into())
            }
        }
    }

    fn remove_raw(&self, full_keys: &[String]) -> StoreResult<u64> {
        if full_keys.is_empty() {
            return Ok(0);
        }
        match &self.backend {
            StoreBackend::Local(store) => Ok(store.delete(full_keys)),
            StoreBackend::Redis {
                client, blocking, ..
            } => self.with_conn(client, blocking, |conn| conn.del::<_, u64>(full_keys)),
        }
    }

    /// Get a value, or `None` on miss or any store failure.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full = self.shared.full_key(key);
        let fetched = match &self.backend {
            StoreBackend::Local(store) => Ok(store.get_bytes(&full).map(|data| data.to_vec())),
            StoreBackend::Redis {
                client, blocking, ..
            } => self.with_conn(client, blocking, |conn| {
                conn.get::<_, Option<Vec<u8>>>(&full)
            }),
        };
        let result = match fetched {
            Ok(Some(data)) => codec::decode::<T>(&data).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        if matches!(result, Err(StoreError::Decode(_))) {
            if let Err(e) = self.remove_raw(&[full]) {
                self.shared.record_failure(self.backend_name(), "get", key, &e);
            }
        }
        self.shared.finish_get(self.backend_name(), key, result)
    }

    /// Serialize and store a value. `ttl` of `None` or `Some(0)` uses the
    /// default TTL.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool {
        let ttl_secs = self.shared.resolve_ttl(ttl);
        let result = codec::encode(value).and_then(|data| {
            let full = self.shared.full_key(key);
            match &self.backend {
                StoreBackend::Local(store) => {
                    store.set_bytes(&full, data, Duration::from_secs(ttl_secs));
                    Ok(())
                }
                StoreBackend::Redis {
                    client, blocking, ..
                } => self.with_conn(client, blocking, |conn| {
                    conn.set_ex::<_, _, ()>(&full, data.as_slice(), ttl_secs)
                }),
            }
        });
        self.shared.finish_set(self.backend_name(), key, ttl_secs, result)
    }

    pub fn delete(&self, key: &str) -> u64 {
        let full = self.shared.full_key(key);
        let result = self.remove_raw(&[full]);
        self.shared
            .finish_delete(self.backend_name(), "delete", key, result)
    }

    /// Blocking counterpart of
    /// [`StoreClient::delete_by_pattern`](super::StoreClient::delete_by_pattern).
    pub fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let full_pattern = self.shared.full_pattern(pattern);
        let keys = match &self.backend {
            StoreBackend::Local(store) => Ok(store.scan(&full_pattern)),
            StoreBackend::Redis {
                client, blocking, ..
            } => self.with_conn(client, blocking, |conn| scan(conn, &full_pattern)),
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
            let result = self.remove_raw(chunk);
            removed += self
                .shared
                .finish_delete(self.backend_name(), "delete_by_pattern", pattern, result);
        }
        if removed > 0 {
            tracing::info!(pattern = %pattern, removed, "pattern invalidation");
        }
        removed
    }

    pub fn exists(&self, key: &str) -> bool {
        let full = self.shared.full_key(key);
        let result = match &self.backend {
            StoreBackend::Local(store) => Ok(store.exists(&full)),
            StoreBackend::Redis {
                client, blocking, ..
            } => self.with_conn(client, blocking, |conn| conn.exists::<_, bool>(&full)),
        };
        result.unwrap_or_else(|e| {
            self.shared
                .record_failure(self.backend_name(), "exists", key, &e);
            false
        })
    }

    pub fn ttl(&self, key: &str) -> KeyTtl {
        let full = self.shared.full_key(key);
        let result = match &self.backend {
            StoreBackend::Local(store) => Ok(store.ttl(&full)),
            StoreBackend::Redis {
                client, blocking, ..
            } => self
                .with_conn(client, blocking, |conn| conn.ttl::<_, i64>(&full))
                .map(KeyTtl::from_reply),
        };
        result.unwrap_or_else(|e| {
            self.shared.record_failure(self.backend_name(), "ttl", key, &e);
            KeyTtl::Missing
        })
    }

    pub fn ping(&self) -> bool {
        match &self.backend {
            StoreBackend::Local(_) => true,
            StoreBackend::Redis {
                client, blocking, ..
            } => {
                let result = self.with_conn(client, blocking, |conn| {
                    redis::cmd("PING").query::<String>(conn)
                });
                match result {
                    Ok(_) => true,
                    Err(e) => {
                        self.shared.record_failure("redis", "ping", "", &e);
                        false
                    }
                }
            }
        }
    }

    pub fn memory_usage(&self) -> Option<MemoryUsage> {
        match &self.backend {
            StoreBackend::Local(store) => Some(MemoryUsage::from_bytes(store.memory_bytes())),
            StoreBackend::Redis {
                client, blocking, ..
            } => {
                let result = self.with_conn(client, blocking, |conn| {
                    redis::cmd("INFO").arg("memory").query::<String>(conn)
                });
                match result {
                    Ok(info) => MemoryUsage::from_info(&info),
                    Err(e) => {
                        self.shared.record_failure("redis", "memory_usage", "", &e);
                        None
                    }
                }
            }
        }
    }
}

fn open_connection(client: &redis::Client, timeout: Duration) -> StoreResult<redis::Connection> {
    let conn = client
        .get_connection_with_timeout(timeout)
        .map_err(|e| StoreError::connect(format!("failed to open blocking connection: {e}")))?;
    conn.set_read_timeout(Some(timeout))?;
    conn.set_write_timeout(Some(timeout))?;
    Ok(conn)
}

fn scan(conn: &mut redis::Connection, pattern: &str) -> redis::RedisResult<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, page) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query::<(u64, Vec<String>)>(conn)?;
        keys.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    keys.sort_unstable();
    keys.dedup();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use crate::store::{StoreClient, StoreOptions};
    use std::time::Duration;

    fn client() -> StoreClient {
        StoreClient::new_local(StoreOptions {
            namespace: "blk".into(),
            default_ttl_secs: 120,
            timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn blocking_round_trip() {
        let store = client().blocking();
        assert!(store.set("suite:1", &serde_json::json!({"name": "Smoke"}), None));
        let value: Option<serde_json::Value> = store.get("suite:1");
        assert_eq!(value, Some(serde_json::json!({"name": "Smoke"})));
        assert!(store.exists("suite:1"));
        assert_eq!(store.delete("suite:1"), 1);
        assert_eq!(store.delete("suite:1"), 0);
        assert!(store.ping());
    }

    #[test]
    fn blocking_pattern_delete() {
        let store = client().blocking();
        for skip in [0, 10, 20] {
            store.set(&format!("runs:list:skip:{skip}:limit:10"), &skip, None);
        }
        assert_eq!(store.delete_by_pattern("runs:list:*"), 3);
        assert_eq!(store.delete_by_pattern("runs:list:*"), 0);
    }

    #[test]
    fn blocking_undecodable_entry_is_dropped() {
        let store = client().blocking();
        store.set("suite:1", "not a number", None);
        assert_eq!(store.get::<u64>("suite:1"), None);
        assert!(!store.exists("suite:1"));
        assert_eq!(store.stats().errors, 1);
        assert_eq!(store.stats().misses, 1);
    }

    #[tokio::test]
    async fn blocking_unreachable_redis_fails_open() {
        let url = "redis://127.0.0.1:1";
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        let client = redis::Client::open(url).unwrap();
        let store = StoreClient::new_redis(
            pool,
            client,
            StoreOptions {
                timeout: Duration::from_millis(200),
                ..StoreOptions::default()
            },
        )
        .blocking();

        assert_eq!(store.get::<u64>("suite:1"), None);
        assert!(!store.set("suite:1", &1u64, None));
        assert_eq!(store.delete("suite:1"), 0);
        assert!(!store.ping());
        let stats = store.stats();
        assert_eq!(stats.errors, 4);
        assert_eq!(stats.misses, 1);
    }
}
