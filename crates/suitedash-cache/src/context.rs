//! Process-wide cache wiring.
//!
//! The application builds one [`CacheContext`] during startup, hands clones
//! of its parts to the services that need them, and calls
//! [`CacheContext::shutdown`] when it stops.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::config::CacheSettings;
use crate::manager::CacheManager;
use crate::store::{StoreClient, StoreOptions};
use crate::tagged::TaggedCache;

/// Create a store client based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: in-process store
/// - **Redis enabled**: connects to Redis, falls back to the in-process
///   store if the pool cannot be created or the first connection fails
///
/// The server can therefore always start, with or without Redis.
pub async fn create_store_client(settings: &CacheSettings) -> StoreClient {
    let options = StoreOptions::from_settings(settings);
    let config = &settings.redis;

    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return StoreClient::new_local(options);
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let client = match redis::Client::open(config.url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid Redis URL. Falling back to local cache.");
            return StoreClient::new_local(options);
        }
    };

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = config.timeout();
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return StoreClient::new_local(options);
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis successfully");
            StoreClient::new_redis(pool, client, options)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            StoreClient::new_local(options)
        }
    }
}

/// The cache components shared by every entity service.
#[derive(Clone)]
pub struct CacheContext {
    pub store: StoreClient,
    pub manager: CacheManager,
    pub tagged: TaggedCache,
    /// Expiry sweep of the in-process backend; `None` with Redis.
    cleanup: Option<AbortHandle>,
}

impl CacheContext {
    pub async fn start(settings: &CacheSettings) -> Self {
        let store = create_store_client(settings).await;
        Self::with_store(store, settings)
    }

    /// Wire the components around an existing store client. Must run inside
    /// a Tokio runtime: a local backend gets its expiry sweep spawned here.
    pub fn with_store(store: StoreClient, settings: &CacheSettings) -> Self {
        let manager = CacheManager::from_settings(store.clone(), settings);
        let tagged = TaggedCache::from_settings(store.clone(), settings);
        let cleanup = store.local_store().map(|local| {
            Arc::clone(local)
                .start_cleanup_task(Duration::from_secs(settings.cleanup_interval_secs.max(1)))
                .abort_handle()
        });
        tracing::info!(
            backend = store.backend_name(),
            namespace = %settings.namespace,
            single_flight = settings.single_flight,
            "cache initialized"
        );
        Self {
            store,
            manager,
            tagged,
            cleanup,
        }
    }

    pub fn shutdown(self) {
        let stats = self.store.stats();
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            sets = stats.sets,
            invalidations = stats.invalidations,
            "cache shutting down"
        );
        if let Some(cleanup) = &self.cleanup {
            cleanup.abort();
        }
        self.store.close();
    }

    /// Whether the local expiry sweep is still running.
    pub fn is_sweeping(&self) -> bool {
        self.cleanup
            .as_ref()
            .is_some_and(|cleanup| !cleanup.is_finished())
    }
}
