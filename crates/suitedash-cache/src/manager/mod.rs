//! Cache manager: key naming, TTL tiers and invalidation helpers.
//!
//! Entity services never build raw keys or pick expirations themselves;
//! they go through the builders in [`keys`] and a [`TtlTier`].
//!
//! ## Invalidation
//!
//! Mutating a single entity removes its own key and every list key of that
//! entity type. List membership is not tracked, so any list may contain the
//! entity.

pub mod keys;
pub mod memoize;
pub mod ttl;

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::sync::Arc;

use crate::config::{CacheSettings, TtlTiersConfig};
use crate::stats::StatsSnapshot;
use crate::store::{BlockingStoreClient, StoreClient};

use keys::{Aggregate, EntityKind, ListQuery};
use memoize::SingleFlight;

pub use memoize::{KeyBuilder, Memoized};
pub use ttl::TtlTier;

#[derive(Clone)]
pub struct CacheManager {
    store: StoreClient,
    blocking: BlockingStoreClient,
    tiers: TtlTiersConfig,
    flights: Option<Arc<SingleFlight>>,
}

impl CacheManager {
    /// Create a manager with single-flight enabled.
    pub fn new(store: StoreClient, tiers: TtlTiersConfig) -> Self {
        let blocking = store.blocking();
        Self {
            store,
            blocking,
            tiers,
            flights: Some(Arc::new(SingleFlight::default())),
        }
    }

    pub fn from_settings(store: StoreClient, settings: &CacheSettings) -> Self {
        Self::new(store, settings.ttl.clone()).with_single_flight(settings.single_flight)
    }

    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.flights = enabled.then(|| Arc::new(SingleFlight::default()));
        self
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    /// Seconds for a tier.
    pub fn ttl(&self, tier: TtlTier) -> u64 {
        tier.seconds(&self.tiers)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.store.stats()
    }

    /// Keys with a computation currently in flight.
    pub fn inflight_keys(&self) -> usize {
        self.flights.as_ref().map_or(0, |flights| flights.len())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.store.get(key).await
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, tier: TtlTier) -> bool {
        self.store.set(key, value, Some(self.ttl(tier))).await
    }

    pub async fn get_entity<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        id: impl fmt::Display,
    ) -> Option<T> {
        self.store.get(&keys::entity_key(kind, id)).await
    }

    /// Cache a single entity under the long tier.
    pub async fn set_entity<T: Serialize + ?Sized>(
        &self,
        kind: EntityKind,
        id: impl fmt::Display,
        value: &T,
    ) -> bool {
        self.set(&keys::entity_key(kind, id), value, TtlTier::Long)
            .await
    }

    pub async fn get_list<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        query: &ListQuery,
    ) -> Option<T> {
        self.store.get(&keys::list_key(kind, query)).await
    }

    /// Cache a list page under the medium tier.
    pub async fn set_list<T: Serialize + ?Sized>(
        &self,
        kind: EntityKind,
        query: &ListQuery,
        value: &T,
    ) -> bool {
        self.set(&keys::list_key(kind, query), value, TtlTier::Medium)
            .await
    }

    pub async fn get_aggregate<T: DeserializeOwned>(
        &self,
        aggregate: Aggregate,
        window: Option<&str>,
    ) -> Option<T> {
        self.store
            .get(&keys::aggregate_key(aggregate, window))
            .await
    }

    /// Cache an aggregate view under the short tier.
    pub async fn set_aggregate<T: Serialize + ?Sized>(
        &self,
        aggregate: Aggregate,
        window: Option<&str>,
        value: &T,
    ) -> bool {
        self.set(&keys::aggregate_key(aggregate, window), value, TtlTier::Short)
            .await
    }

    pub async fn invalidate_key(&self, key: &str) -> u64 {
        self.store.delete(key).await
    }

    /// Remove an entity and every list of its type. Returns the number of
    /// keys removed; 0 when nothing was cached.
    pub async fn invalidate_entity(&self, kind: EntityKind, id: impl fmt::Display) -> u64 {
        let key = keys::entity_key(kind, id);
        let removed = self.store.delete(&key).await + self.invalidate_lists(kind).await;
        tracing::debug!(entity = %kind, key = %key, removed, "entity invalidated");
        removed
    }

    pub async fn invalidate_lists(&self, kind: EntityKind) -> u64 {
        self.store
            .delete_by_pattern(&keys::list_pattern(kind))
            .await
    }

    pub async fn invalidate_aggregates(&self) -> u64 {
        self.store
            .delete_by_pattern(&keys::aggregate_pattern())
            .await
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        self.store.delete_by_pattern(pattern).await
    }

    /// Full flush of this namespace.
    pub async fn clear_all(&self) -> u64 {
        let removed = self.store.flush().await;
        tracing::info!(removed, "cache cleared");
        removed
    }

    /// Blocking counterpart of [`invalidate_entity`](Self::invalidate_entity).
    pub fn invalidate_entity_blocking(&self, kind: EntityKind, id: impl fmt::Display) -> u64 {
        let key = keys::entity_key(kind, id);
        self.blocking.delete(&key) + self.blocking.delete_by_pattern(&keys::list_pattern(kind))
    }
}
