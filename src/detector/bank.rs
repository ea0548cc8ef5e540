//! Per-column CUSUM bank
//!
//! Five detector families (bytes, packets, entropy ratio, received-to-sent
//! bytes, received-to-sent flows), one [`AdaptiveCusum`] per destination
//! sketch column each. Treating every column as an independent signal
//! sidesteps key tracking during learning: calibration learns a per-column
//! threshold and falls back to a family-wide quantile for columns that
//! never fired.

use crate::cusum::{quantile_sorted, AdaptiveCusum};
use crate::detector::metrics::WindowMetrics;
use crate::thresholds::ColumnThresholds;

pub struct CusumBank {
    pub bytes: Vec<AdaptiveCusum>,
    pub packets: Vec<AdaptiveCusum>,
    pub entropy: Vec<AdaptiveCusum>,
    pub recv_sent_bytes: Vec<AdaptiveCusum>,
    pub recv_sent_flows: Vec<AdaptiveCusum>,
}

impl CusumBank {
    pub fn new(width: usize, c: f64, alpha: f64, span: u32) -> Self {
        let family = || (0..width).map(|_| AdaptiveCusum::new(c, alpha, span)).collect();
        Self {
            bytes: family(),
            packets: family(),
            entropy: family(),
            recv_sent_bytes: family(),
            recv_sent_flows: family(),
        }
    }

    pub fn width(&self) -> usize {
        self.bytes.len()
    }

    /// Feed one window's metrics for `col` into all five families.
    pub fn observe(&mut self, col: usize, metrics: &WindowMetrics, learning: bool) {
        self.bytes[col].process(metrics.bytes, learning);
        self.packets[col].process(metrics.packets, learning);
        self.entropy[col].process(metrics.entropy, learning);
        self.recv_sent_bytes[col].process(metrics.recv_sent_bytes, learning);
        self.recv_sent_flows[col].process(metrics.recv_sent_flows, learning);
    }

    /// Calibrate thresholds from the learning-phase maxima.
    ///
    /// A column that fired during learning keeps its own maximum; silent
    /// columns inherit the family quantile over the non-zero maxima. Only
    /// the entropy family carries a low-arm threshold.
    pub fn calibrate(&mut self, quantile: f64) {
        let q_bytes = family_quantile_high(&self.bytes, quantile);
        let q_packets = family_quantile_high(&self.packets, quantile);
        let q_entropy = family_quantile_high(&self.entropy, quantile);
        let q_entropy_low = family_quantile_low(&self.entropy, quantile);
        let q_rs_bytes = family_quantile_high(&self.recv_sent_bytes, quantile);
        let q_rs_flows = family_quantile_high(&self.recv_sent_flows, quantile);

        for col in 0..self.width() {
            set_high(&mut self.bytes[col], q_bytes);
            set_high(&mut self.packets[col], q_packets);
            set_high(&mut self.entropy[col], q_entropy);
            set_low(&mut self.entropy[col], q_entropy_low);
            set_high(&mut self.recv_sent_bytes[col], q_rs_bytes);
            set_high(&mut self.recv_sent_flows[col], q_rs_flows);
        }
    }

    /// Current thresholds, one row per column, for persistence.
    pub fn thresholds(&self) -> Vec<ColumnThresholds> {
        (0..self.width())
            .map(|col| ColumnThresholds {
                bytes: self.bytes[col].threshold_high(),
                packets: self.packets[col].threshold_high(),
                entropy_high: self.entropy[col].threshold_high(),
                entropy_low: self.entropy[col].threshold_low(),
                recv_sent_bytes: self.recv_sent_bytes[col].threshold_high(),
                recv_sent_flows: self.recv_sent_flows[col].threshold_high(),
            })
            .collect()
    }

    /// Install previously persisted thresholds.
    pub fn apply_thresholds(&mut self, rows: &[ColumnThresholds]) {
        for (col, row) in rows.iter().enumerate() {
            self.bytes[col].set_threshold_high(row.bytes);
            self.packets[col].set_threshold_high(row.packets);
            self.entropy[col].set_threshold_high(row.entropy_high);
            self.entropy[col].set_threshold_low(row.entropy_low);
            self.recv_sent_bytes[col].set_threshold_high(row.recv_sent_bytes);
            self.recv_sent_flows[col].set_threshold_high(row.recv_sent_flows);
        }
    }
}

fn set_high(cusum: &mut AdaptiveCusum, family_quantile: f64) {
    if cusum.max_sh() > 0.0 {
        cusum.set_threshold_high(cusum.max_sh());
    } else {
        cusum.set_threshold_high(family_quantile);
    }
}

fn set_low(cusum: &mut AdaptiveCusum, family_quantile: f64) {
    if cusum.max_sl() > 0.0 {
        cusum.set_threshold_low(cusum.max_sl());
    } else {
        cusum.set_threshold_low(family_quantile);
    }
}

fn family_quantile_high(family: &[AdaptiveCusum], quantile: f64) -> f64 {
    let mut maxima: Vec<f64> = family
        .iter()
        .map(AdaptiveCusum::max_sh)
        .filter(|&x| x > 0.0)
        .collect();
    maxima.sort_by(f64::total_cmp);
    quantile_sorted(&maxima, quantile)
}

fn family_quantile_low(family: &[AdaptiveCusum], quantile: f64) -> f64 {
    let mut maxima: Vec<f64> = family
        .iter()
        .map(AdaptiveCusum::max_sl)
        .filter(|&x| x > 0.0)
        .collect();
    maxima.sort_by(f64::total_cmp);
    quantile_sorted(&maxima, quantile)
}
