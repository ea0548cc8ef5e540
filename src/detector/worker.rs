//! Detection worker thread
//!
//! Consumes window snapshots from the pipe, peels the heavy destination
//! prefixes out of every sketch column, feeds the five metrics into the
//! CUSUM bank and raises an alert when all five positive arms fire at
//! once. Threshold calibration happens on the first window after the
//! learning phase ends; false-positive feedback is drained at the start of
//! every window once thresholds exist.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::bank::CusumBank;
use super::metrics;
use super::stats::StatsWriter;
use super::WindowSnapshot;
use crate::clock::Clock;
use crate::models::{Alert, PREFIX24_MASK};
use crate::pipe::WindowPipe;
use crate::prefix::PrefixTrie;
use crate::sketch::{BitCount, CountMinSketch, VictimCell};
use crate::thresholds;

pub(super) struct DetectionWorker {
    pub pipe: Arc<WindowPipe<WindowSnapshot>>,
    pub stop: Arc<AtomicBool>,
    pub clock: Arc<Clock>,
    pub protected: Arc<PrefixTrie>,
    pub whitelist: Arc<PrefixTrie>,
    pub alert_tx: Sender<Alert>,
    pub feedback_rx: Receiver<Alert>,
    pub bank: CusumBank,
    pub thresholds_set: bool,
    pub learning_secs: u64,
    pub quantile: f64,
    pub top_n: usize,
    pub alert_interval_secs: i64,
    pub thresholds_file: PathBuf,
    pub stats: Option<StatsWriter>,
    pub windows_processed: Arc<AtomicU64>,
}

/// Everything recovered from one destination column of one window.
pub(super) struct ColumnRecovery {
    /// The byte-heaviest protected /24 peeled from the column.
    pub max_ip: u32,
    /// Sum of all peeled cells.
    pub acc: VictimCell,
    /// `(src_ip, flow_tally)` walked back out of the source sketch.
    pub sources: Vec<(u32, u32)>,
    /// Every protected /24 recovered from the column.
    pub prefixes: BTreeSet<u32>,
}

impl DetectionWorker {
    pub fn run(mut self) {
        let learn_until = self.clock.now() + Duration::seconds(self.learning_secs as i64);
        info!(
            learning_secs = self.learning_secs,
            quantile = self.quantile,
            "detection worker started"
        );

        loop {
            let mut snap = self.pipe.recv();
            if self.stop.load(Ordering::SeqCst) {
                self.shutdown();
                return;
            }

            let now = self.clock.now();
            let learning = now < learn_until;

            if !self.thresholds_set && !learning {
                self.bank.calibrate(self.quantile);
                self.thresholds_set = true;
                info!("learning phase over, thresholds calibrated");
            }
            if self.thresholds_set {
                self.drain_false_positives();
            }

            for col in 0..snap.dst.width() {
                if snap.dst.cell(0, col).count == 0 {
                    continue;
                }
                let Some(recovery) = reverse_column(&self.protected, &mut snap, col) else {
                    continue;
                };
                let window_metrics = metrics::compute(&recovery.acc, &recovery.sources);
                self.bank.observe(col, &window_metrics, learning);
                if let Some(stats) = self.stats.as_mut() {
                    stats.record(col, &recovery.prefixes, &recovery.acc, &window_metrics, &self.bank);
                }

                if self.thresholds_set && self.alert_allowed(col, now) {
                    if self.detect_anomaly(&recovery, col) {
                        self.bank.bytes[col].set_last_alert(now);
                    }
                }
            }
            self.windows_processed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Per-column alert cooldown, tracked on the bytes family.
    fn alert_allowed(&self, col: usize, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.bank.bytes[col].last_alert() {
            Some(last) => now - last > Duration::seconds(self.alert_interval_secs),
            None => true,
        }
    }

    /// All five positive arms must fire on the same column, scaled by the
    /// victim's sensitivity multiplier, and at least one reportable source
    /// must remain after whitelisting.
    fn detect_anomaly(&mut self, recovery: &ColumnRecovery, col: usize) -> bool {
        let victim = Ipv4Addr::from(recovery.max_ip);
        let multiplier = self.protected.lookup(victim).unwrap_or(0.0);

        let fired = self.bank.bytes[col].is_positive_anomaly(multiplier)
            && self.bank.packets[col].is_positive_anomaly(multiplier)
            && self.bank.recv_sent_bytes[col].is_positive_anomaly(multiplier)
            && self.bank.recv_sent_flows[col].is_positive_anomaly(multiplier)
            && self.bank.entropy[col].is_positive_anomaly(multiplier);
        if !fired {
            return false;
        }

        let src_ips = top_sources(
            &recovery.sources,
            &self.protected,
            &self.whitelist,
            self.top_n,
        );
        if src_ips.is_empty() {
            debug!(%victim, col, "anomaly fired but every source was whitelisted");
            return false;
        }

        let alert = Alert {
            dst_ip: victim,
            threshold_bytes: self.bank.bytes[col].threshold_high() * multiplier,
            threshold_packets: self.bank.packets[col].threshold_high() * multiplier,
            threshold_entropy: self.bank.entropy[col].threshold_high() * multiplier,
            threshold_recv_sent_bytes: self.bank.recv_sent_bytes[col].threshold_high() * multiplier,
            threshold_recv_sent_flows: self.bank.recv_sent_flows[col].threshold_high() * multiplier,
            measured_bytes: self.bank.bytes[col].sh(),
            measured_packets: self.bank.packets[col].sh(),
            measured_entropy: self.bank.entropy[col].sh(),
            measured_recv_sent_bytes: self.bank.recv_sent_bytes[col].sh(),
            measured_recv_sent_flows: self.bank.recv_sent_flows[col].sh(),
            cusum_id: col as u32,
            src_ips,
        };
        warn!(%victim, col, sources = alert.src_ips.len(), "volumetric attack detected");
        let _ = self.alert_tx.send(alert);
        true
    }

    /// A returned alert widens the column's tolerance permanently: the
    /// measured values, rescaled by the victim's multiplier, become the new
    /// high thresholds.
    fn drain_false_positives(&mut self) {
        while let Ok(feedback) = self.feedback_rx.try_recv() {
            let col = feedback.cusum_id as usize;
            if col >= self.bank.width() {
                warn!(cusum_id = feedback.cusum_id, "feedback for unknown column dropped");
                continue;
            }
            let multiplier = self.protected.lookup(feedback.dst_ip).unwrap_or(0.0);
            if multiplier <= 0.0 {
                warn!(dst_ip = %feedback.dst_ip, "feedback for unprotected prefix dropped");
                continue;
            }
            self.bank.bytes[col].set_threshold_high(feedback.measured_bytes / multiplier);
            self.bank.packets[col].set_threshold_high(feedback.measured_packets / multiplier);
            self.bank.entropy[col].set_threshold_high(feedback.measured_entropy / multiplier);
            self.bank.recv_sent_bytes[col]
                .set_threshold_high(feedback.measured_recv_sent_bytes / multiplier);
            self.bank.recv_sent_flows[col]
                .set_threshold_high(feedback.measured_recv_sent_flows / multiplier);
            info!(dst_ip = %feedback.dst_ip, col, "false positive applied, thresholds raised");
        }
    }

    fn shutdown(&mut self) {
        if let Err(err) = thresholds::store(&self.thresholds_file, &self.bank.thresholds()) {
            error!(error = %err, "failed to persist thresholds on shutdown");
        } else {
            info!(path = %self.thresholds_file.display(), "thresholds persisted");
        }
        if let Some(stats) = self.stats.as_mut() {
            stats.flush();
        }
    }
}

/// Peel the heavy protected prefixes out of row 0, column `col`.
///
/// Each round reverses the dominant key, verifies it through `estimate`,
/// accumulates the minimum cell and subtracts it from every row, exposing
/// the next-heaviest candidate. The loop ends when the column count stops
/// changing, the recovered cell is empty, or the candidate is not a
/// protected prefix (collision noise).
pub(super) fn reverse_column(
    protected: &PrefixTrie,
    snap: &mut WindowSnapshot,
    col: usize,
) -> Option<ColumnRecovery> {
    let mut prev = 0u32;
    let mut max_ip = 0u32;
    let mut max_bytes = 0u64;
    let mut acc = VictimCell::new();
    let mut rows: BTreeMap<u32, usize> = BTreeMap::new();
    let mut prefixes = BTreeSet::new();

    while snap.dst.cell(0, col).count != prev {
        prev = snap.dst.cell(0, col).count;
        let candidate = snap.dst.cell(0, col).value.reverse_key();
        let prefix = candidate & PREFIX24_MASK;

        let (row, inner_col) = snap.dst.estimate(prefix);
        let cell = snap.dst.cell(row, inner_col).clone();
        if cell.count == 0 || !protected.contains(Ipv4Addr::from(prefix)) {
            break;
        }

        if cell.value.byte_count() > max_bytes {
            max_bytes = cell.value.byte_count();
            max_ip = prefix;
        }
        for &src_idx in cell.value.communicated_with().keys() {
            rows.insert(src_idx, row);
        }
        acc.merge(&cell.value);
        snap.dst.subtract(prefix, &cell);
        prefixes.insert(prefix);
    }

    if max_ip == 0 {
        return None;
    }
    let sources = reverse_sources(&acc, &rows, &snap.src);
    Some(ColumnRecovery {
        max_ip,
        acc,
        sources,
        prefixes,
    })
}

/// Walk the accumulated source indices back into source addresses.
///
/// Each index is read on the destination row it was recorded under; the
/// reversed key is verified through `estimate` and paired with the flow
/// tally. The source sketch is never decremented, so each index yields its
/// dominant key once.
pub(super) fn reverse_sources(
    acc: &VictimCell,
    rows: &BTreeMap<u32, usize>,
    src: &CountMinSketch<BitCount>,
) -> Vec<(u32, u32)> {
    let mut sources = Vec::new();
    for (&src_idx, &tally) in acc.communicated_with() {
        let Some(&row) = rows.get(&src_idx) else {
            continue;
        };
        let mut prev = 0u32;
        while src.cell(row, src_idx as usize).count != prev {
            prev = src.cell(row, src_idx as usize).count;
            let recovered = src.cell(row, src_idx as usize).value.reverse_key();
            let (vrow, vcol) = src.estimate(recovered);
            if src.cell(vrow, vcol).count == 0 {
                break;
            }
            sources.push((recovered, tally));
        }
    }
    sources
}

/// Heaviest sources by flow tally, skipping protected and whitelisted
/// addresses, at most `n` distinct results.
pub(super) fn top_sources(
    sources: &[(u32, u32)],
    protected: &PrefixTrie,
    whitelist: &PrefixTrie,
    n: usize,
) -> Vec<Ipv4Addr> {
    let mut ranked: Vec<(u32, u32)> = sources.to_vec();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let mut seen = HashSet::new();
    let mut top = Vec::new();
    for (bits, _) in ranked {
        let addr = Ipv4Addr::from(bits);
        if protected.contains(addr) || whitelist.contains(addr) {
            continue;
        }
        if seen.insert(bits) {
            top.push(addr);
            if top.len() == n {
                break;
            }
        }
    }
    top
}
