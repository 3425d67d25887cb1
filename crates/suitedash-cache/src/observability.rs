//! Tracing setup for processes embedding the cache.
//!
//! The cache only emits `tracing` events; installing a subscriber is left to
//! the host. These helpers install one driven by [`LoggingConfig`], with a
//! reloadable filter so the level can be changed without a restart.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

/// Noisy dependency targets kept at `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["redis", "deadpool", "testcontainers"];

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Builds the filter for a level: the level itself plus `warn` for
/// dependency targets.
pub fn cache_filter(level: &str) -> EnvFilter {
    let mut directives = level.to_ascii_lowercase();
    for target in QUIET_TARGETS {
        directives.push_str(&format!(",{target}=warn"));
    }
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_tracing(config: &LoggingConfig) {
    init_tracing_with_level(&config.level);
}

/// Install the global subscriber. `RUST_LOG`, when set and valid, wins over
/// `level`. A second call is a no-op.
pub fn init_tracing_with_level(level: &str) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| cache_filter(level));

    let (reload_layer, handle) = reload::Layer::new(filter);
    if tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
    {
        let _ = LOG_RELOAD_HANDLE.set(handle);
        tracing::debug!(level, "cache tracing initialized");
    }
}

/// Switch the log level at runtime. Returns `false` when no subscriber was
/// installed through [`init_tracing`].
pub fn apply_logging_level(level: &str) -> bool {
    match LOG_RELOAD_HANDLE.get() {
        Some(handle) => handle.modify(|f| *f = cache_filter(level)).is_ok(),
        None => false,
    }
}
