// Peer quality scoring from observed transfer behavior.

/// Smoothing for the latency moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.3;

const MIB: f64 = 1024.0 * 1024.0;

/// Per-peer transfer statistics.
#[derive(Debug, Clone, Default)]
pub struct PeerMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    /// EWMA of response latency in milliseconds.
    pub avg_latency_ms: f64,
    pub total_bytes: u64,
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, latency_ms: u64, bytes: u64) {
        if self.success_count == 0 {
            self.avg_latency_ms = latency_ms as f64;
        } else {
            self.avg_latency_ms = LATENCY_EWMA_ALPHA * latency_ms as f64
                + (1.0 - LATENCY_EWMA_ALPHA) * self.avg_latency_ms;
        }
        self.success_count += 1;
        self.total_bytes += bytes;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn total_requests(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Weighted score in [0, 1]:
    /// reliability (0.5) + latency (0.3) + upload volume (0.2).
    /// A peer with no observations sits at the neutral 0.5.
    pub fn score(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.5;
        }

        let reliability = self.success_count as f64 / total as f64;

        let latency_score = (1.0 - (self.avg_latency_ms - 100.0) / 1900.0).clamp(0.0, 1.0);

        let upload_score = if self.success_count > 0 {
            let avg_bytes = self.total_bytes as f64 / self.success_count as f64;
            (avg_bytes / MIB).min(1.0)
        } else {
            0.0
        };

        0.5 * reliability + 0.3 * latency_score + 0.2 * upload_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_is_neutral() {
        assert_eq!(PeerMetrics::new().score(), 0.5);
    }

    #[test]
    fn perfect_fast_large_peer_scores_high() {
        let mut m = PeerMetrics::new();
        // 100 ms latency gives a full latency score; 1 MiB per transfer
        // gives a full upload score.
        for _ in 0..10 {
            m.record_success(100, 1024 * 1024);
        }
        assert!((m.score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn slow_peer_loses_latency_component() {
        let mut m = PeerMetrics::new();
        m.record_success(2_000, 1024 * 1024);
        // latency score = 1 - (2000-100)/1900 = 0
        assert!((m.score() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn failures_erode_reliability() {
        let mut m = PeerMetrics::new();
        m.record_success(100, 1024 * 1024);
        m.record_failure();
        m.record_failure();
        m.record_failure();
        // reliability 0.25, latency 1.0, upload 1.0
        let expected = 0.5 * 0.25 + 0.3 + 0.2;
        assert!((m.score() - expected).abs() < 1e-9);
    }

    #[test]
    fn latency_average_is_ewma() {
        let mut m = PeerMetrics::new();
        m.record_success(1_000, 0);
        assert_eq!(m.avg_latency_ms, 1_000.0);
        m.record_success(100, 0);
        // 0.3 * 100 + 0.7 * 1000
        assert!((m.avg_latency_ms - 730.0).abs() < 1e-9);
    }

    #[test]
    fn all_failures_floor_near_latency_zero() {
        let mut m = PeerMetrics::new();
        m.record_failure();
        m.record_failure();
        // reliability 0, upload 0, latency score computed from avg 0 → 1.0
        // clamped: 1 - (0-100)/1900 = 1.05 → 1.0, weighted 0.3.
        assert!((m.score() - 0.3).abs() < 1e-9);
    }
}
