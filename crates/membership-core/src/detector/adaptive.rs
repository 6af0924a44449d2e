use super::{phi, DetectorConfig, FailureDetector};

/// Detector that recalibrates itself from an exponentially weighted history.
///
/// Recent intervals weigh more than old ones, so the model follows changes in
/// scheduling quickly. The modelled standard deviation never drops below
/// `scale × mean`: a peer heartbeating every 2s tolerates proportionally longer
/// pauses than one heartbeating every 100ms.
#[derive(Debug, Clone)]
pub struct AdaptiveDetector {
    threshold: f64,
    alpha: f64,
    scale: f64,
    min_samples: usize,
    min_std_deviation_ms: f64,
    min_interval_ms: i64,
    mean: f64,
    variance: f64,
    samples: usize,
    last_arrival: Option<i64>,
}

impl AdaptiveDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            threshold: config.conviction_threshold,
            alpha: config.alpha.clamp(f64::EPSILON, 1.0),
            scale: config.scale,
            min_samples: config.min_samples,
            min_std_deviation_ms: config.min_std_deviation_ms,
            min_interval_ms: config.min_interval_ms,
            mean: 0.0,
            variance: 0.0,
            samples: 0,
            last_arrival: None,
        }
    }

    /// Current acceptable-pause floor (`scale × mean`).
    pub fn pause_floor(&self) -> f64 {
        self.scale * self.mean
    }

    fn std_deviation(&self) -> f64 {
        self.variance
            .sqrt()
            .max(self.pause_floor())
            .max(self.min_std_deviation_ms)
    }

    fn observe(&mut self, interval: f64) {
        if self.samples == 0 {
            self.mean = interval;
            self.variance = 0.0;
        } else {
            let diff = interval - self.mean;
            let increment = self.alpha * diff;
            self.mean += increment;
            self.variance = (1.0 - self.alpha) * (self.variance + diff * increment);
        }
        self.samples += 1;
    }
}

impl FailureDetector for AdaptiveDetector {
    fn record_arrival(&mut self, now_ms: i64) {
        if let Some(last) = self.last_arrival {
            let interval = now_ms - last;
            if interval < self.min_interval_ms {
                return;
            }
            self.observe(interval as f64);
        }
        self.last_arrival = Some(now_ms);
    }

    fn suspicion(&self, now_ms: i64) -> f64 {
        let Some(last) = self.last_arrival else {
            return 0.0;
        };
        if self.samples < self.min_samples.max(1) {
            return 0.0;
        }
        let elapsed = (now_ms - last).max(0) as f64;
        phi(elapsed, self.mean, self.std_deviation())
    }

    fn is_available(&self, now_ms: i64) -> bool {
        self.suspicion(now_ms) <= self.threshold
    }

    fn last_arrival(&self) -> Option<i64> {
        self.last_arrival
    }
}
