//! Accrual failure detection.
//!
//! Instead of a binary alive/dead verdict after a fixed timeout, each peer gets
//! a continuous suspicion level computed from the history of heartbeat
//! inter-arrival times. The engine keeps one detector per peer and converts the
//! suspicion into a classification.
//!
//! Two strategies are available:
//! - [`PhiAccrualDetector`]: sliding window of intervals, normal-distribution model
//! - [`AdaptiveDetector`]: exponentially weighted mean/variance with a pause
//!   floor that scales with the mean interval

mod adaptive;
mod phi;

pub use adaptive::AdaptiveDetector;
pub use phi::PhiAccrualDetector;

use serde::{Deserialize, Serialize};

/// Per-peer failure detector.
///
/// `record_arrival` is called exactly once per accepted direct heartbeat.
/// Between arrivals, `suspicion` is non-decreasing in `now_ms`, so a peer that
/// stays silent never becomes "more available".
pub trait FailureDetector: Send {
    /// Record a heartbeat arrival at `now_ms`.
    fn record_arrival(&mut self, now_ms: i64);

    /// Current suspicion level. Always finite and non-negative.
    fn suspicion(&self, now_ms: i64) -> f64;

    /// Whether the suspicion is at or below the conviction threshold.
    fn is_available(&self, now_ms: i64) -> bool;

    /// Timestamp of the last recorded arrival.
    fn last_arrival(&self) -> Option<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[default]
    Phi,
    Adaptive,
}

/// Detector settings, shared by every peer. Also the factory for detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub kind: DetectorKind,

    /// Suspicion above which a peer is considered dead
    #[serde(default = "default_conviction_threshold")]
    pub conviction_threshold: f64,

    /// Number of intervals kept by the phi detector
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Below this many intervals the detector reports zero suspicion
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Lower bound on the modelled standard deviation
    #[serde(default = "default_min_std_deviation_ms")]
    pub min_std_deviation_ms: f64,

    /// Arrivals closer together than this are treated as duplicates
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: i64,

    /// EWMA smoothing factor for the adaptive detector
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Adaptive pause floor as a fraction of the mean interval
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_conviction_threshold() -> f64 {
    11.0
}

fn default_window_size() -> usize {
    1000
}

fn default_min_samples() -> usize {
    3
}

fn default_min_std_deviation_ms() -> f64 {
    500.0
}

fn default_min_interval_ms() -> i64 {
    1
}

fn default_alpha() -> f64 {
    0.1
}

fn default_scale() -> f64 {
    0.75
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::default(),
            conviction_threshold: default_conviction_threshold(),
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            min_std_deviation_ms: default_min_std_deviation_ms(),
            min_interval_ms: default_min_interval_ms(),
            alpha: default_alpha(),
            scale: default_scale(),
        }
    }
}

impl DetectorConfig {
    /// Create a fresh detector for one peer.
    pub fn create(&self) -> Box<dyn FailureDetector> {
        match self.kind {
            DetectorKind::Phi => Box::new(PhiAccrualDetector::new(self)),
            DetectorKind::Adaptive => Box::new(AdaptiveDetector::new(self)),
        }
    }
}

/// Phi for `elapsed_ms` of silence given a normal model of intervals.
///
/// Uses the logistic approximation of the normal CDF. The tail probability is
/// clamped to `f64::MIN_POSITIVE`, so the result is finite (at most ~307.65).
pub(crate) fn phi(elapsed_ms: f64, mean_ms: f64, std_dev_ms: f64) -> f64 {
    let y = (elapsed_ms - mean_ms) / std_dev_ms;
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    // P(interval > elapsed); written so that e = 0 and e = inf both stay finite
    let p_later = 1.0 / (1.0 + 1.0 / e);
    (-p_later.max(f64::MIN_POSITIVE).log10()).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phi_at_mean_is_half() {
        let value = phi(1000.0, 1000.0, 100.0);
        assert!((value - 0.5f64.log10().abs()).abs() < 1e-9);
    }

    #[test]
    fn test_phi_is_finite_at_extremes() {
        for elapsed in [0.0, 1.0e3, 1.0e6, 1.0e12, f64::MAX / 4.0] {
            let value = phi(elapsed, 1000.0, 100.0);
            assert!(value.is_finite(), "phi({elapsed}) = {value}");
            assert!(value >= 0.0);
        }
    }

    #[test]
    fn test_phi_monotone_in_elapsed() {
        let mut prev = 0.0;
        for step in 0..200 {
            let value = phi(step as f64 * 50.0, 1000.0, 200.0);
            assert!(value >= prev);
            prev = value;
        }
    }

    #[test]
    fn test_config_factory_respects_kind() {
        let mut config = DetectorConfig::default();
        let mut phi = config.create();
        config.kind = DetectorKind::Adaptive;
        let mut adaptive = config.create();
        for t in (0..=5000).step_by(1000) {
            phi.record_arrival(t);
            adaptive.record_arrival(t);
        }
        assert_eq!(phi.last_arrival(), Some(5000));
        assert_eq!(adaptive.last_arrival(), Some(5000));
        assert!(phi.is_available(5500));
        assert!(adaptive.is_available(5500));
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: DetectorConfig = serde_json::from_str(r#"{"kind": "adaptive"}"#).unwrap();
        assert_eq!(config.kind, DetectorKind::Adaptive);
        assert_eq!(config.conviction_threshold, 11.0);
        assert_eq!(config.window_size, 1000);
        assert_eq!(config.scale, 0.75);
    }
}
