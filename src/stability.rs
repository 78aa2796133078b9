//! Stability detection over successive measurement windows
//!
//! A run is stable once the most recent k samples of both throughput and
//! latency all lie within ±tolerance of the running mean of those k.
//! Throughput alone can look stable while latency drifts under queue
//! growth, and vice versa; requiring both jointly catches both regimes.

use serde::Serialize;

/// Joint throughput/latency stability detector
///
/// Feed one observation per measurement window with
/// [`StabilityDetector::observe`]; [`StabilityDetector::is_stable`] turns
/// true once the last `recent_window` samples of both series stay within
/// the tolerance band around their own mean.
#[derive(Debug, Clone, Serialize)]
pub struct StabilityDetector {
    /// Number of trailing samples that must agree
    recent_window: usize,
    /// Fractional tolerance around the running mean
    tolerance: f64,
    throughput: Vec<f64>,
    latency_ns: Vec<f64>,
}

impl StabilityDetector {
    /// Create a detector over the last `recent_window` samples with a
    /// fractional `tolerance` (0.10 = ±10%)
    #[must_use]
    pub fn new(recent_window: usize, tolerance: f64) -> Self {
        Self {
            recent_window,
            tolerance,
            throughput: Vec::new(),
            latency_ns: Vec::new(),
        }
    }

    /// Record one measurement window
    #[allow(clippy::cast_precision_loss)]
    pub fn observe(&mut self, infer_per_sec: u64, avg_latency_ns: u64) {
        self.throughput.push(infer_per_sec as f64);
        self.latency_ns.push(avg_latency_ns as f64);
    }

    /// Number of windows observed so far
    #[must_use]
    pub fn samples(&self) -> usize {
        self.throughput.len()
    }

    /// Whether both series are inside the tolerance band
    #[must_use]
    pub fn is_stable(&self) -> bool {
        if self.samples() < self.recent_window {
            return false;
        }
        within_band(&self.throughput, self.recent_window, self.tolerance)
            && within_band(&self.latency_ns, self.recent_window, self.tolerance)
    }
}

/// Whether the last `window` values all lie within ±`tolerance` of their
/// own mean
#[allow(clippy::cast_precision_loss)]
fn within_band(values: &[f64], window: usize, tolerance: f64) -> bool {
    let recent = &values[values.len() - window..];
    let mean = recent.iter().sum::<f64>() / window as f64;
    recent
        .iter()
        .all(|value| *value >= mean * (1.0 - tolerance) && *value <= mean * (1.0 + tolerance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_not_stable_before_k_samples() {
        let mut detector = StabilityDetector::new(3, 0.10);
        detector.observe(100, 1_000_000);
        detector.observe(100, 1_000_000);
        assert!(!detector.is_stable());
    }

    #[test]
    fn test_stable_with_constant_series() {
        let mut detector = StabilityDetector::new(3, 0.10);
        for _ in 0..3 {
            detector.observe(100, 1_000_000);
        }
        assert!(detector.is_stable());
    }

    #[test]
    fn test_unstable_when_throughput_drifts() {
        let mut detector = StabilityDetector::new(3, 0.10);
        detector.observe(100, 1_000_000);
        detector.observe(150, 1_000_000);
        detector.observe(225, 1_000_000);
        assert!(!detector.is_stable());
    }

    #[test]
    fn test_unstable_when_latency_drifts() {
        let mut detector = StabilityDetector::new(3, 0.10);
        detector.observe(100, 1_000_000);
        detector.observe(100, 2_000_000);
        detector.observe(100, 4_000_000);
        assert!(!detector.is_stable());
    }

    #[test]
    fn test_only_recent_window_matters() {
        let mut detector = StabilityDetector::new(3, 0.10);
        // A noisy start followed by three settled windows.
        detector.observe(10, 9_000_000);
        detector.observe(500, 100_000);
        detector.observe(100, 1_000_000);
        detector.observe(101, 1_010_000);
        detector.observe(99, 990_000);
        assert!(detector.is_stable());
    }

    #[test]
    fn test_bounded_oscillation_within_tolerance() {
        let mut detector = StabilityDetector::new(3, 0.10);
        detector.observe(95, 1_000_000);
        detector.observe(100, 1_050_000);
        detector.observe(105, 950_000);
        assert!(detector.is_stable());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // The predicate is scale-invariant: multiplying every sample of
        // both series by one positive constant never changes the outcome.
        #[test]
        fn prop_stability_is_scale_invariant(
            samples in proptest::collection::vec((1_u64..10_000, 1_000_u64..10_000_000), 3..8),
            scale in 2_u64..50,
        ) {
            let mut plain = StabilityDetector::new(3, 0.10);
            let mut scaled = StabilityDetector::new(3, 0.10);
            for (ips, latency) in &samples {
                plain.observe(*ips, *latency);
                scaled.observe(*ips * scale, *latency * scale);
            }
            prop_assert_eq!(plain.is_stable(), scaled.is_stable());
        }
    }
}
