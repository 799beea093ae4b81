// Engine-wide delivery metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Atomic counters shared across the fetch and append pipeline.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub peer_fetches: AtomicU64,
    pub peer_bytes: AtomicU64,
    pub origin_fetches: AtomicU64,
    pub origin_bytes: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub segments_appended: AtomicU64,
    pub rebuffer_events: AtomicU64,
}

/// Point-in-time view of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub peer_fetches: u64,
    pub peer_bytes: u64,
    pub origin_fetches: u64,
    pub origin_bytes: u64,
    pub fetch_failures: u64,
    pub segments_appended: u64,
    pub rebuffer_events: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_fetch(&self, bytes: u64) {
        self.peer_fetches.fetch_add(1, Ordering::Relaxed);
        self.peer_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_origin_fetch(&self, bytes: u64) {
        self.origin_fetches.fetch_add(1, Ordering::Relaxed);
        self.origin_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_appended(&self) {
        self.segments_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuffer(&self) {
        self.rebuffer_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            peer_fetches: self.peer_fetches.load(Ordering::Relaxed),
            peer_bytes: self.peer_bytes.load(Ordering::Relaxed),
            origin_fetches: self.origin_fetches.load(Ordering::Relaxed),
            origin_bytes: self.origin_bytes.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            segments_appended: self.segments_appended.load(Ordering::Relaxed),
            rebuffer_events: self.rebuffer_events.load(Ordering::Relaxed),
        }
    }

    /// Log a one-line delivery summary.
    pub fn log_summary(&self) {
        let snap = self.snapshot();
        let total_fetches = snap.peer_fetches + snap.origin_fetches;
        let peer_share = if total_fetches > 0 {
            snap.peer_fetches as f64 / total_fetches as f64
        } else {
            0.0
        };
        info!(
            cache_hits = snap.cache_hits,
            cache_misses = snap.cache_misses,
            peer_fetches = snap.peer_fetches,
            origin_fetches = snap.origin_fetches,
            peer_share = format!("{:.0}%", peer_share * 100.0),
            peer_bytes = snap.peer_bytes,
            origin_bytes = snap.origin_bytes,
            failures = snap.fetch_failures,
            appended = snap.segments_appended,
            rebuffers = snap.rebuffer_events,
            "Delivery statistics"
        );
    }
}
