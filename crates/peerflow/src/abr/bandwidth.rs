// Bandwidth estimation strategies over (bytes, latency) download samples.

use std::collections::VecDeque;

/// Throughput of one sample in bits per second.
fn sample_bps(bytes: u64, latency_ms: u64) -> f64 {
    bytes as f64 * 8_000.0 / latency_ms.max(1) as f64
}

pub trait BandwidthEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn add_sample(&mut self, bytes: u64, latency_ms: u64);

    /// Current estimate in bits per second; `None` before any sample.
    fn estimate_bps(&self) -> Option<f64>;

    fn reset(&mut self);
}

/// Windowed average with linear recency weights (newest sample weighs most).
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new(10)
    }
}

impl BandwidthEstimator for MovingAverage {
    fn name(&self) -> &'static str {
        "moving-average"
    }

    fn add_sample(&mut self, bytes: u64, latency_ms: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_bps(bytes, latency_ms));
    }

    fn estimate_bps(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (i, sample) in self.samples.iter().enumerate() {
            let weight = (i + 1) as f64;
            weighted += sample * weight;
            total_weight += weight;
        }
        Some(weighted / total_weight)
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Exponentially weighted moving average.
pub struct Ewma {
    alpha: f64,
    estimate: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            estimate: None,
        }
    }
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl BandwidthEstimator for Ewma {
    fn name(&self) -> &'static str {
        "ewma"
    }

    fn add_sample(&mut self, bytes: u64, latency_ms: u64) {
        let rate = sample_bps(bytes, latency_ms);
        self.estimate = Some(match self.estimate {
            None => rate,
            Some(prev) => self.alpha * rate + (1.0 - self.alpha) * prev,
        });
    }

    fn estimate_bps(&self) -> Option<f64> {
        self.estimate
    }

    fn reset(&mut self) {
        self.estimate = None;
    }
}

/// Harmonic mean over a window; robust against single fast outliers.
pub struct HarmonicMean {
    window: usize,
    samples: VecDeque<f64>,
}

impl HarmonicMean {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }
}

impl Default for HarmonicMean {
    fn default() -> Self {
        Self::new(10)
    }
}

impl BandwidthEstimator for HarmonicMean {
    fn name(&self) -> &'static str {
        "harmonic-mean"
    }

    fn add_sample(&mut self, bytes: u64, latency_ms: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_bps(bytes, latency_ms));
    }

    fn estimate_bps(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let reciprocal_sum: f64 = self.samples.iter().map(|r| 1.0 / r.max(f64::EPSILON)).sum();
        Some(self.samples.len() as f64 / reciprocal_sum)
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Percentile of the sample window, default p50.
pub struct Percentile {
    window: usize,
    percentile: f64,
    samples: VecDeque<f64>,
}

impl Percentile {
    pub fn new(window: usize, percentile: f64) -> Self {
        Self {
            window: window.max(1),
            percentile: percentile.clamp(0.0, 100.0),
            samples: VecDeque::new(),
        }
    }
}

impl Default for Percentile {
    fn default() -> Self {
        Self::new(10, 50.0)
    }
}

impl BandwidthEstimator for Percentile {
    fn name(&self) -> &'static str {
        "percentile"
    }

    fn add_sample(&mut self, bytes: u64, latency_ms: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_bps(bytes, latency_ms));
    }

    fn estimate_bps(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = (self.percentile / 100.0) * (sorted.len() - 1) as f64;
        Some(sorted[rank.round() as usize])
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Meta-strategy: EWMA while throughput is steady, moving average once the
/// recent coefficient of variation exceeds the threshold.
pub struct Adaptive {
    ewma: Ewma,
    moving_average: MovingAverage,
    recent: VecDeque<f64>,
    variance_threshold: f64,
}

impl Adaptive {
    pub fn new(alpha: f64, window: usize, variance_threshold: f64) -> Self {
        Self {
            ewma: Ewma::new(alpha),
            moving_average: MovingAverage::new(window),
            recent: VecDeque::new(),
            variance_threshold,
        }
    }

    fn coefficient_of_variation(&self) -> f64 {
        if self.recent.len() < 2 {
            return 0.0;
        }
        let n = self.recent.len() as f64;
        let mean = self.recent.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = self.recent.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt() / mean
    }
}

impl Default for Adaptive {
    fn default() -> Self {
        Self::new(0.3, 10, 0.2)
    }
}

impl BandwidthEstimator for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn add_sample(&mut self, bytes: u64, latency_ms: u64) {
        self.ewma.add_sample(bytes, latency_ms);
        self.moving_average.add_sample(bytes, latency_ms);
        if self.recent.len() == 10 {
            self.recent.pop_front();
        }
        self.recent.push_back(sample_bps(bytes, latency_ms));
    }

    fn estimate_bps(&self) -> Option<f64> {
        if self.coefficient_of_variation() > self.variance_threshold {
            self.moving_average.estimate_bps()
        } else {
            self.ewma.estimate_bps()
        }
    }

    fn reset(&mut self) {
        self.ewma.reset();
        self.moving_average.reset();
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_is_exact_for_every_strategy() {
        // 1 MB over 2 s = 4 Mbps.
        let expected = 1_000_000.0 * 8_000.0 / 2_000.0;
        let strategies: Vec<Box<dyn BandwidthEstimator>> = vec![
            Box::new(MovingAverage::default()),
            Box::new(Ewma::default()),
            Box::new(HarmonicMean::default()),
            Box::new(Percentile::default()),
            Box::new(Adaptive::default()),
        ];
        for mut strategy in strategies {
            strategy.add_sample(1_000_000, 2_000);
            let estimate = strategy.estimate_bps().unwrap();
            assert!(
                (estimate - expected).abs() < 1e-6,
                "{} deviated: {estimate}",
                strategy.name()
            );
        }
    }

    #[test]
    fn ewma_converges_on_identical_samples() {
        let mut ewma = Ewma::new(0.3);
        let expected = sample_bps(500_000, 1_000);
        for _ in 0..20 {
            ewma.add_sample(500_000, 1_000);
        }
        let estimate = ewma.estimate_bps().unwrap();
        assert!((estimate - expected).abs() / expected < 0.01);
    }

    #[test]
    fn moving_average_weights_recency() {
        let mut ma = MovingAverage::new(10);
        ma.add_sample(1_000_000, 1_000); // 8 Mbps
        ma.add_sample(2_000_000, 1_000); // 16 Mbps, newer
        let estimate = ma.estimate_bps().unwrap();
        // Weighted (1*8 + 2*16) / 3 = 13.33 Mbps.
        assert!((estimate - 13_333_333.333).abs() < 1.0);
    }

    #[test]
    fn harmonic_mean_dampens_outliers() {
        let mut hm = HarmonicMean::new(10);
        hm.add_sample(1_000_000, 1_000); // 8 Mbps
        hm.add_sample(100_000_000, 1_000); // 800 Mbps outlier
        let estimate = hm.estimate_bps().unwrap();
        // Harmonic mean sits near the slow sample.
        assert!(estimate < 20_000_000.0);
    }

    #[test]
    fn percentile_picks_median() {
        let mut p = Percentile::new(10, 50.0);
        for latency in [1_000, 2_000, 4_000] {
            p.add_sample(1_000_000, latency);
        }
        let estimate = p.estimate_bps().unwrap();
        assert!((estimate - sample_bps(1_000_000, 2_000)).abs() < 1e-6);
    }

    #[test]
    fn adaptive_switches_on_variance() {
        let mut adaptive = Adaptive::default();
        // Steady stream: low variance, EWMA path.
        for _ in 0..5 {
            adaptive.add_sample(1_000_000, 1_000);
        }
        assert!(adaptive.coefficient_of_variation() <= 0.2);
        let steady = adaptive.estimate_bps().unwrap();
        assert!((steady - sample_bps(1_000_000, 1_000)).abs() < 1e-6);

        // Wildly varying samples push it over the threshold.
        adaptive.add_sample(10_000_000, 1_000);
        adaptive.add_sample(100_000, 1_000);
        assert!(adaptive.coefficient_of_variation() > 0.2);
    }

    #[test]
    fn reset_clears_state() {
        let mut ewma = Ewma::default();
        ewma.add_sample(1_000, 10);
        ewma.reset();
        assert!(ewma.estimate_bps().is_none());
    }
}
