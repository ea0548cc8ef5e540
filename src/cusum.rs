//! Adaptive CUSUM change-point detection
//!
//! One detector instance tracks a single traffic statistic for a single
//! sketch column. The mean and variance follow an EWMA; the positive and
//! negative arms accumulate deviations beyond a slack of `c * sqrt(v)`.
//! Keeping the tracker running while the arms stay frozen (during learning,
//! until `span` observations have passed) avoids cold-start false triggers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveCusum {
    c: f64,
    alpha: f64,
    span: u32,
    mean: f64,
    variance: f64,
    sh: f64,
    sl: f64,
    max_sh: f64,
    max_sl: f64,
    threshold_high: f64,
    threshold_low: f64,
    window_id: u32,
    last_alert: Option<DateTime<Utc>>,
    first: bool,
}

impl AdaptiveCusum {
    pub fn new(c: f64, alpha: f64, span: u32) -> Self {
        Self {
            c,
            alpha,
            span,
            mean: 0.0,
            variance: 0.0,
            sh: 0.0,
            sl: 0.0,
            max_sh: 0.0,
            max_sl: 0.0,
            threshold_high: 0.0,
            threshold_low: 0.0,
            window_id: 0,
            last_alert: None,
            first: true,
        }
    }

    /// Advance one observation.
    ///
    /// The first call only seeds the mean. Afterwards the EWMA tracker
    /// always advances, while the CUSUM arms move only outside the learning
    /// phase or once `span` observations have stabilised the tracker.
    pub fn process(&mut self, x: f64, learning: bool) {
        if self.first {
            self.mean = x;
            self.variance = 0.0;
            self.first = false;
            return;
        }
        let diff = x - self.mean;
        self.mean += self.alpha * diff;
        self.variance = (1.0 - self.alpha) * self.variance + self.alpha * diff * diff;

        if !learning || self.window_id >= self.span {
            let slack = self.c * self.variance.sqrt();
            self.sh = (self.sh + (x - self.mean) - slack).max(0.0);
            self.sl = (self.sl - (x - self.mean) - slack).max(0.0);
        }
        self.max_sh = self.sh.max(self.max_sh);
        self.max_sl = self.sl.max(self.max_sl);
        self.window_id += 1;
    }

    pub fn is_positive_anomaly(&self, multiplier: f64) -> bool {
        self.sh > self.threshold_high * multiplier
    }

    pub fn is_negative_anomaly(&self, multiplier: f64) -> bool {
        self.sl > self.threshold_low * multiplier
    }

    pub fn sh(&self) -> f64 {
        self.sh
    }

    pub fn sl(&self) -> f64 {
        self.sl
    }

    pub fn max_sh(&self) -> f64 {
        self.max_sh
    }

    pub fn max_sl(&self) -> f64 {
        self.max_sl
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn threshold_high(&self) -> f64 {
        self.threshold_high
    }

    pub fn threshold_low(&self) -> f64 {
        self.threshold_low
    }

    pub fn set_threshold_high(&mut self, threshold: f64) {
        self.threshold_high = threshold;
    }

    pub fn set_threshold_low(&mut self, threshold: f64) {
        self.threshold_low = threshold;
    }

    pub fn window_id(&self) -> u32 {
        self.window_id
    }

    pub fn last_alert(&self) -> Option<DateTime<Utc>> {
        self.last_alert
    }

    pub fn set_last_alert(&mut self, at: DateTime<Utc>) {
        self.last_alert = Some(at);
    }
}

/// Quantile of an ascending-sorted slice by linear interpolation.
///
/// `q` is clamped to the slice: 0.0 yields the first element, 1.0 the last.
/// An empty slice yields 0.0.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (sorted.len() - 1) as f64 * q;
    let lower = index as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    let t = index - lower as f64;
    sorted[lower] * (1.0 - t) + sorted[upper] * t
}
