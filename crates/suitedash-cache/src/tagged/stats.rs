use serde::Serialize;
use std::collections::BTreeMap;

use crate::stats::StatsSnapshot;
use crate::store::{MemoryUsage, StoreClient};

/// Operational view of a cache client.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// "local" or "redis".
    pub backend: &'static str,
    pub counters: StatsSnapshot,
    /// Percentage of reads served from the cache.
    pub hit_rate: f64,
    /// Backing-store memory, when the store reports it.
    pub memory: Option<MemoryUsage>,
    /// Live member count per requested tag; an invalidated tag reports 0.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, usize>,
}

impl CacheStats {
    pub(crate) async fn collect(store: &StoreClient) -> Self {
        let counters = store.stats();
        Self {
            backend: store.backend_name(),
            counters,
            hit_rate: counters.hit_rate(),
            memory: store.memory_usage().await,
            tags: BTreeMap::new(),
        }
    }
}
