//! Process-local cache counters.
//!
//! Counters belong to a single store client (and its clones). They are
//! diagnostic only: never persisted, never shared between instances, and
//! reset when the process restarts.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of successful writes.
    pub sets: u64,
    /// Number of entries removed by explicit invalidation.
    pub invalidations: u64,
    /// Number of store failures that were swallowed.
    pub errors: u64,
}

impl StatsSnapshot {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_calculation() {
        let stats = StatsSnapshot {
            hits: 75,
            misses: 25,
            sets: 10,
            invalidations: 5,
            errors: 0,
        };

        assert!((stats.hit_rate() - 75.0).abs() < 0.001);

        let empty_stats = StatsSnapshot::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn counters_accumulate() {
        let counters = CacheCounters::default();
        counters.record_hit();
        counters.record_miss();
        counters.record_miss();
        counters.record_set();
        counters.record_invalidations(3);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 2);
        assert_eq!(snapshot.sets, 1);
        assert_eq!(snapshot.invalidations, 3);
    }
}
