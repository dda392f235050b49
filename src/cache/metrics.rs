//! Cache Metrics Collection
//!
//! Counters for the guard, the logical cache and the counter aggregator.
//! One instance is shared by every component built from the same
//! [`crate::service::LinkService`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Guard / logical cache reads
    hits: AtomicU64,
    misses: AtomicU64,
    tombstone_hits: AtomicU64,
    fallback_calls: AtomicU64,
    stale_served: AtomicU64,

    // Rebuilds
    rebuilds_submitted: AtomicU64,
    rebuilds_completed: AtomicU64,
    rebuilds_failed: AtomicU64,
    rebuilds_rejected: AtomicU64,
    lock_contention: AtomicU64,

    // Counters and rankings
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    ranking_warms: AtomicU64,

    // Volatile store failures absorbed by a component
    store_errors: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tombstone_hit(&self) {
        self.tombstone_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_call(&self) {
        self.fallback_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_submitted(&self) {
        self.rebuilds_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_completed(&self) {
        self.rebuilds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_failed(&self) {
        self.rebuilds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_rejected(&self) {
        self.rebuilds_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ranking_warm(&self) {
        self.ranking_warms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn fallback_calls(&self) -> u64 {
        self.fallback_calls.load(Ordering::Relaxed)
    }

    pub fn rebuilds_completed(&self) -> u64 {
        self.rebuilds_completed.load(Ordering::Relaxed)
    }

    /// Fraction of reads answered from the cache, tombstones included
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.hits() + self.tombstone_hits.load(Ordering::Relaxed)) as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            tombstone_hits: self.tombstone_hits.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls(),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),

            rebuilds_submitted: self.rebuilds_submitted.load(Ordering::Relaxed),
            rebuilds_completed: self.rebuilds_completed(),
            rebuilds_failed: self.rebuilds_failed.load(Ordering::Relaxed),
            rebuilds_rejected: self.rebuilds_rejected.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),

            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            ranking_warms: self.ranking_warms.load(Ordering::Relaxed),

            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub tombstone_hits: u64,
    pub fallback_calls: u64,
    pub stale_served: u64,
    pub hit_ratio: f64,

    pub rebuilds_submitted: u64,
    pub rebuilds_completed: u64,
    pub rebuilds_failed: u64,
    pub rebuilds_rejected: u64,
    pub lock_contention: u64,

    pub flushes: u64,
    pub flush_failures: u64,
    pub ranking_warms: u64,

    pub store_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_hit();
        metrics.record_tombstone_hit();
        metrics.record_miss();

        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_rebuild_submitted();
        metrics.record_rebuild_failed();
        metrics.record_flush();
        metrics.record_flush();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rebuilds_submitted, 1);
        assert_eq!(snapshot.rebuilds_failed, 1);
        assert_eq!(snapshot.flushes, 2);
        assert_eq!(snapshot.rebuilds_completed, 0);
    }
}
