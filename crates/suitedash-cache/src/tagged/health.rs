use serde::Serialize;
use std::time::Instant;
use time::OffsetDateTime;

use super::stats::CacheStats;
use crate::store::StoreClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// The store is unreachable; callers keep working without a cache.
    Degraded,
}

/// Liveness check result plus a stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backend: &'static str,
    pub store_reachable: bool,
    pub latency_ms: f64,
    pub stats: CacheStats,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

impl HealthReport {
    pub(crate) async fn check(store: &StoreClient) -> Self {
        let started = Instant::now();
        let store_reachable = store.ping().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = if store_reachable {
            HealthStatus::Healthy
        } else {
            tracing::warn!(backend = store.backend_name(), "cache store unreachable");
            HealthStatus::Degraded
        };
        Self {
            status,
            backend: store.backend_name(),
            store_reachable,
            latency_ms,
            stats: CacheStats::collect(store).await,
            checked_at: OffsetDateTime::now_utc(),
        }
    }
}
