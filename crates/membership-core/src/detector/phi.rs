use super::{phi, DetectorConfig, FailureDetector};
use std::collections::VecDeque;

/// Phi-accrual detector over a bounded sliding window of inter-arrival times.
#[derive(Debug, Clone)]
pub struct PhiAccrualDetector {
    threshold: f64,
    window_size: usize,
    min_samples: usize,
    min_std_deviation_ms: f64,
    min_interval_ms: i64,
    intervals: VecDeque<f64>,
    sum: f64,
    sum_of_squares: f64,
    last_arrival: Option<i64>,
}

impl PhiAccrualDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            threshold: config.conviction_threshold,
            window_size,
            min_samples: config.min_samples,
            min_std_deviation_ms: config.min_std_deviation_ms,
            min_interval_ms: config.min_interval_ms,
            intervals: VecDeque::with_capacity(window_size.min(64)),
            sum: 0.0,
            sum_of_squares: 0.0,
            last_arrival: None,
        }
    }

    /// Number of intervals currently held.
    pub fn sample_count(&self) -> usize {
        self.intervals.len()
    }

    fn push_interval(&mut self, interval: f64) {
        if self.intervals.len() == self.window_size {
            if let Some(dropped) = self.intervals.pop_front() {
                self.sum -= dropped;
                self.sum_of_squares -= dropped * dropped;
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
        self.sum_of_squares += interval * interval;
    }

    fn mean(&self) -> f64 {
        self.sum / self.intervals.len() as f64
    }

    fn variance(&self) -> f64 {
        let mean = self.mean();
        let variance = self.sum_of_squares / self.intervals.len() as f64 - mean * mean;
        variance.max(self.min_std_deviation_ms * self.min_std_deviation_ms)
    }
}

impl FailureDetector for PhiAccrualDetector {
    fn record_arrival(&mut self, now_ms: i64) {
        if let Some(last) = self.last_arrival {
            let interval = now_ms - last;
            if interval < self.min_interval_ms {
                return;
            }
            self.push_interval(interval as f64);
        }
        self.last_arrival = Some(now_ms);
    }

    fn suspicion(&self, now_ms: i64) -> f64 {
        let Some(last) = self.last_arrival else {
            return 0.0;
        };
        if self.intervals.len() < self.min_samples.max(1) {
            return 0.0;
        }
        let elapsed = (now_ms - last).max(0) as f64;
        phi(elapsed, self.mean(), self.variance().sqrt())
    }

    fn is_available(&self, now_ms: i64) -> bool {
        self.suspicion(now_ms) <= self.threshold
    }

    fn last_arrival(&self) -> Option<i64> {
        self.last_arrival
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PhiAccrualDetector {
        PhiAccrualDetector::new(&DetectorConfig::default())
    }

    fn with_regular_arrivals(count: i64, interval: i64) -> PhiAccrualDetector {
        let mut d = detector();
        for i in 0..count {
            d.record_arrival(i * interval);
        }
        d
    }

    #[test]
    fn test_cold_start_reports_zero() {
        let mut d = detector();
        assert_eq!(d.suspicion(1_000_000), 0.0);
        d.record_arrival(0);
        d.record_arrival(1000);
        d.record_arrival(2000);
        // Two intervals, below min_samples
        assert_eq!(d.suspicion(1_000_000), 0.0);
        assert!(d.is_available(1_000_000));
    }

    #[test]
    fn test_suspicion_rises_with_silence() {
        let d = with_regular_arrivals(10, 1000);
        let last = 9000;
        let mut prev = d.suspicion(last);
        for elapsed in (100..20_000).step_by(100) {
            let value = d.suspicion(last + elapsed);
            assert!(value >= prev, "suspicion fell at +{elapsed}ms");
            assert!(value.is_finite());
            prev = value;
        }
    }

    #[test]
    fn test_availability_is_monotone() {
        let d = with_regular_arrivals(10, 1000);
        let mut was_available = true;
        for elapsed in (0..10_000).step_by(50) {
            let available = d.is_available(9000 + elapsed);
            assert!(was_available || !available, "became available again at +{elapsed}ms");
            was_available = available;
        }
        assert!(!was_available);
    }

    #[test]
    fn test_regular_heartbeats_stay_available() {
        let d = with_regular_arrivals(10, 1000);
        assert!(d.is_available(9000 + 1000));
        assert!(d.is_available(9000 + 1200));
        assert!(!d.is_available(9000 + 5000));
    }

    #[test]
    fn test_zero_variance_window_is_finite() {
        let d = with_regular_arrivals(100, 1000);
        let value = d.suspicion(99_000 + 1_000_000);
        assert!(value.is_finite());
        assert!(value > 11.0);
    }

    #[test]
    fn test_duplicate_arrivals_ignored() {
        let mut d = detector();
        d.record_arrival(1000);
        d.record_arrival(1000);
        d.record_arrival(1000);
        assert_eq!(d.sample_count(), 0);
        d.record_arrival(2000);
        assert_eq!(d.sample_count(), 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let config = DetectorConfig {
            window_size: 5,
            ..DetectorConfig::default()
        };
        let mut d = PhiAccrualDetector::new(&config);
        for i in 0..50 {
            d.record_arrival(i * 1000);
        }
        assert_eq!(d.sample_count(), 5);
        assert!((d.mean() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_forgets_old_intervals() {
        let config = DetectorConfig {
            window_size: 4,
            ..DetectorConfig::default()
        };
        let mut d = PhiAccrualDetector::new(&config);
        let mut t = 0;
        for _ in 0..4 {
            d.record_arrival(t);
            t += 100;
        }
        for _ in 0..5 {
            t += 5000;
            d.record_arrival(t);
        }
        assert!((d.mean() - 5000.0).abs() < 1e-6);
    }
}
