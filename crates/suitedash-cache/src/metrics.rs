//! Prometheus metrics for the caching layer.
//!
//! Counters mirror the process-local [`CacheCounters`](crate::stats::CacheCounters)
//! so hit rates can also be scraped across instances.

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_SETS_TOTAL: &str = "cache_sets_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
    pub const CACHE_STORE_ERRORS_TOTAL: &str = "cache_store_errors_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a cache hit.
pub fn record_cache_hit(backend: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "backend" => backend).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(backend: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "backend" => backend).increment(1);
}

/// Record a successful write.
pub fn record_cache_set(backend: &'static str) {
    counter!(names::CACHE_SETS_TOTAL, "backend" => backend).increment(1);
}

/// Record removed entries.
pub fn record_cache_invalidations(backend: &'static str, count: u64) {
    if count > 0 {
        counter!(names::CACHE_INVALIDATIONS_TOTAL, "backend" => backend).increment(count);
    }
}

/// Record a swallowed store failure.
pub fn record_store_error(op: &'static str, kind: &'static str) {
    counter!(names::CACHE_STORE_ERRORS_TOTAL, "op" => op, "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_after_init() {
        init_metrics();
        assert!(!init_metrics());

        record_cache_hit("local");
        record_cache_invalidations("local", 3);
        record_store_error("get", "timeout");

        let rendered = render_metrics().unwrap();
        assert!(rendered.contains(names::CACHE_HITS_TOTAL));
        assert!(rendered.contains(names::CACHE_INVALIDATIONS_TOTAL));
        assert!(rendered.contains("kind=\"timeout\""));
    }
}
