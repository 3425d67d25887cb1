use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level settings for the caching layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// TTL tiers used by the cache manager
    #[serde(default)]
    pub ttl: TtlTiersConfig,
    /// Per-category default TTLs for the tagged cache
    #[serde(default)]
    pub categories: CategoryTtlConfig,
    /// Prefix prepended to every key written by this process
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Serialize concurrent misses on the same key
    #[serde(default = "default_single_flight")]
    pub single_flight: bool,
    /// Expiry for tag and dependency index sets, refreshed on every registration
    #[serde(default = "default_index_ttl_secs")]
    pub index_ttl_secs: u64,
    /// How often the in-process backend sweeps expired entries
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_namespace() -> String {
    "suitedash".to_string()
}

fn default_single_flight() -> bool {
    true
}

fn default_index_ttl_secs() -> u64 {
    86_400
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            ttl: TtlTiersConfig::default(),
            categories: CategoryTtlConfig::default(),
            namespace: default_namespace(),
            single_flight: default_single_flight(),
            index_ttl_secs: default_index_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "redis.enabled=true requires redis.url".into(),
            ));
        }
        if self.redis.pool_size == 0 {
            return Err(ConfigError::Invalid("redis.pool_size must be > 0".into()));
        }
        if self.redis.timeout_ms == 0 {
            return Err(ConfigError::Invalid("redis.timeout_ms must be > 0".into()));
        }
        let tiers = [
            ("ttl.short_secs", self.ttl.short_secs),
            ("ttl.medium_secs", self.ttl.medium_secs),
            ("ttl.long_secs", self.ttl.long_secs),
            ("ttl.extended_secs", self.ttl.extended_secs),
            ("categories.default_ttl_secs", self.categories.default_ttl_secs),
            ("index_ttl_secs", self.index_ttl_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
        ];
        for (name, secs) in tiers {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if let Some((name, _)) = self.categories.overrides.iter().find(|(_, secs)| **secs == 0) {
            return Err(ConfigError::Invalid(format!(
                "categories.overrides.{name} must be > 0"
            )));
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades to the in-process store without it)
    /// Default: false
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connect, pool wait and per-command timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Expirations for the four cache manager tiers, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlTiersConfig {
    /// Fast-changing aggregates
    #[serde(default = "default_short_secs")]
    pub short_secs: u64,
    /// List queries
    #[serde(default = "default_medium_secs")]
    pub medium_secs: u64,
    /// Slow-changing entities
    #[serde(default = "default_long_secs")]
    pub long_secs: u64,
    /// Near-static data
    #[serde(default = "default_extended_secs")]
    pub extended_secs: u64,
}

fn default_short_secs() -> u64 {
    60
}

fn default_medium_secs() -> u64 {
    600
}

fn default_long_secs() -> u64 {
    3600
}

fn default_extended_secs() -> u64 {
    86_400
}

impl Default for TtlTiersConfig {
    fn default() -> Self {
        Self {
            short_secs: default_short_secs(),
            medium_secs: default_medium_secs(),
            long_secs: default_long_secs(),
            extended_secs: default_extended_secs(),
        }
    }
}

/// Default TTL table for tagged-cache categories (key prefixes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryTtlConfig {
    /// Used for any prefix without an override; also the store-level default
    #[serde(default = "default_category_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_category_overrides")]
    pub overrides: HashMap<String, u64>,
}

fn default_category_ttl_secs() -> u64 {
    300
}

fn default_category_overrides() -> HashMap<String, u64> {
    [
        ("project", 3600),
        ("suite", 600),
        ("test_case", 600),
        ("test_run", 300),
        ("user", 1800),
        ("dashboard", 60),
        ("report", 900),
    ]
    .into_iter()
    .map(|(name, secs)| (name.to_string(), secs))
    .collect()
}

impl Default for CategoryTtlConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_category_ttl_secs(),
            overrides: default_category_overrides(),
        }
    }
}

impl CategoryTtlConfig {
    /// Default TTL for a category, falling back to `default_ttl_secs`.
    pub fn ttl_for(&self, category: &str) -> u64 {
        self.overrides
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheSettings;
    use crate::error::ConfigError;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    /// Load settings from a TOML file (if present) overlaid with
    /// `SUITEDASH__*` environment variables, then validate them.
    pub fn load_settings(path: Option<&str>) -> Result<CacheSettings, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("suitedash.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., SUITEDASH__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("SUITEDASH")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder.build().map_err(ConfigError::Build)?;
        let merged: CacheSettings = cfg.try_deserialize().map_err(ConfigError::Deserialize)?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_settings_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<CacheSettings, ConfigError> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_settings(p.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = CacheSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.ttl.short_secs, 60);
        assert_eq!(settings.ttl.extended_secs, 86_400);
        assert_eq!(settings.namespace, "suitedash");
    }

    #[test]
    fn category_ttl_falls_back_to_default() {
        let categories = CategoryTtlConfig::default();
        assert_eq!(categories.ttl_for("suite"), 600);
        assert_eq!(categories.ttl_for("unknown"), categories.default_ttl_secs);
    }

    #[test]
    fn zero_tier_is_rejected() {
        let mut settings = CacheSettings::default();
        settings.ttl.medium_secs = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("ttl.medium_secs"));
    }

    #[test]
    fn zero_category_override_is_rejected() {
        let mut settings = CacheSettings::default();
        settings.categories.overrides.insert("suite".into(), 0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let mut settings = CacheSettings::default();
        settings.logging.level = "loud".into();
        assert!(settings.validate().is_err());
    }
}
