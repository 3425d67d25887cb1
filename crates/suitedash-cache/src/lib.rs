//! Caching layer for the SuiteDash backend.
//!
//! ## Architecture
//!
//! ```text
//! entity services ──► CacheManager  (key naming, TTL tiers, memoization)
//!                 └─► TaggedCache   (tags, dependencies, stats, health)
//!                           │
//!                      StoreClient  (async + blocking, fail-open)
//!                           │
//!                Redis (shared) │ LocalStore (fallback)
//! ```
//!
//! ## Read path
//!
//! Look up by constructed key; on a miss compute from the database and write
//! back with a tier. After a create/update/delete, call the matching
//! invalidation helper.
//!
//! ## Graceful Degradation
//!
//! The cache is never a correctness dependency. Store outages, timeouts and
//! encoding failures are logged and behave like a miss or a no-op.

pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod observability;
pub mod stats;
pub mod store;
pub mod tagged;

pub use config::{CacheSettings, CategoryTtlConfig, LoggingConfig, RedisConfig, TtlTiersConfig};
pub use context::{CacheContext, create_store_client};
pub use error::{ConfigError, StoreError};
pub use manager::keys::{Aggregate, EntityKind, ListQuery};
pub use manager::{CacheManager, Memoized, TtlTier};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};
pub use stats::StatsSnapshot;
pub use store::{BlockingStoreClient, KeyTtl, LocalStore, StoreClient, StoreOptions};
pub use tagged::{
    CacheStats, EntryOptions, HealthReport, HealthStatus, TaggedCache, WarmOptions, WarmReport,
};
