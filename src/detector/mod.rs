//! Two-stage streaming detection pipeline
//!
//! The ingest stage runs in the caller's thread: it classifies each flow
//! against the protected trie and updates the live sketch pair. At every
//! window boundary the pair is handed through a single-slot pipe to the
//! detection worker, which reverses heavy keys, drives the CUSUM bank and
//! emits alerts. Alerts and false-positive feedback travel over channels so
//! the transport layer never touches detector internals.

mod bank;
pub mod metrics;
mod stats;
mod worker;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::clock::{Clock, ClockMode};
use crate::config::{Config, CUSUM_SLACK, SKETCH_DEPTH};
use crate::models::{Alert, FlowRecord, PREFIX24_MASK};
use crate::pipe::WindowPipe;
use crate::prefix::PrefixTrie;
use crate::sketch::{BitCount, CountMinSketch, VictimCell};
use crate::thresholds;

use bank::CusumBank;
use stats::StatsWriter;
use worker::DetectionWorker;

/// One accumulation window's worth of sketches, shipped through the pipe.
pub struct WindowSnapshot {
    pub dst: CountMinSketch<VictimCell>,
    pub src: CountMinSketch<BitCount>,
}

impl WindowSnapshot {
    /// Fresh pair with plain (non-conservative, learning) counting; used by
    /// tests to build windows by hand.
    pub fn empty(depth: usize, dst_width: usize, src_width: usize, seed: u64) -> Self {
        Self {
            dst: CountMinSketch::new(depth, dst_width, false, true, seed),
            src: CountMinSketch::new(depth, src_width, false, true, seed.wrapping_add(1)),
        }
    }
}

/// Classify one flow and update the live sketch pair.
///
/// Traffic towards a protected prefix lands in the destination sketch under
/// its /24 key, and the per-row flow counters record which source-sketch
/// column it came from. Traffic *from* a protected prefix only bumps the
/// sent-side tallies on the cells its /24 hashes to. Anything else is
/// dropped. Matched flows always feed the source sketch with magnitude 1.
pub(crate) fn ingest(
    dst: &mut CountMinSketch<VictimCell>,
    src: &mut CountMinSketch<BitCount>,
    protected: &PrefixTrie,
    record: &FlowRecord,
) {
    if protected.contains(record.dst) {
        let key = record.dst_bits() & PREFIX24_MASK;
        dst.update(key, record);
        for row in 0..dst.depth() {
            let src_idx = src.col(record.src_bits(), row) as u32;
            let col = dst.col(key, row);
            dst.cell_mut(row, col).value.update_flow_counter(src_idx);
        }
    } else if protected.contains(record.src) {
        let key = record.src_bits() & PREFIX24_MASK;
        for row in 0..dst.depth() {
            let col = dst.col(key, row);
            dst.cell_mut(row, col).value.update_sent_bytes(record.bytes);
        }
    } else {
        return;
    }
    src.update(record.src_bits(), &1);
}

/// The detector: ingest API on the caller side, detection worker behind the
/// pipe, alert/feedback channels to the transport.
pub struct FloodDetector {
    dst_live: CountMinSketch<VictimCell>,
    src_live: CountMinSketch<BitCount>,
    protected: Arc<PrefixTrie>,
    pipe: Arc<WindowPipe<WindowSnapshot>>,
    stop: Arc<AtomicBool>,
    blocking_handoff: bool,
    alert_rx: Receiver<Alert>,
    feedback_tx: Sender<Alert>,
    windows_processed: Arc<AtomicU64>,
    worker: Option<DetectionWorker>,
    handle: Option<JoinHandle<()>>,
}

impl FloodDetector {
    pub fn new(
        config: &Config,
        protected: Arc<PrefixTrie>,
        whitelist: Arc<PrefixTrie>,
        clock: Arc<Clock>,
    ) -> Result<Self> {
        let learning_secs = config.learning_secs()?;
        // A run without learning trusts persisted thresholds and counts
        // conservatively; a learning run counts plainly so warm-up windows
        // accumulate unclipped.
        let conservative = learning_secs == 0;
        let learning = learning_secs != 0;

        let dst_live = CountMinSketch::new(
            SKETCH_DEPTH,
            config.dst_sketch_width,
            conservative,
            learning,
            config.sketch_seed,
        );
        let src_live = CountMinSketch::new(
            SKETCH_DEPTH,
            config.src_sketch_width,
            conservative,
            learning,
            config.sketch_seed.wrapping_add(1),
        );

        let mut cusum_bank = CusumBank::new(
            config.dst_sketch_width,
            CUSUM_SLACK,
            config.alpha(),
            config.span,
        );
        let mut thresholds_set = false;
        if learning_secs == 0 {
            let rows = thresholds::load(&config.thresholds_file, config.dst_sketch_width)
                .context("learning is disabled, persisted thresholds are required")?;
            cusum_bank.apply_thresholds(&rows);
            thresholds_set = true;
        }

        let stats = config
            .stats_file
            .as_deref()
            .map(StatsWriter::create)
            .transpose()?;

        let pipe = Arc::new(WindowPipe::new());
        let stop = Arc::new(AtomicBool::new(false));
        let windows_processed = Arc::new(AtomicU64::new(0));
        let (alert_tx, alert_rx) = crossbeam_channel::unbounded();
        let (feedback_tx, feedback_rx) = crossbeam_channel::unbounded();

        let worker = DetectionWorker {
            pipe: Arc::clone(&pipe),
            stop: Arc::clone(&stop),
            clock,
            protected: Arc::clone(&protected),
            whitelist,
            alert_tx,
            feedback_rx,
            bank: cusum_bank,
            thresholds_set,
            learning_secs,
            quantile: config.quantile,
            top_n: config.top_n,
            alert_interval_secs: config.alert_interval_secs,
            thresholds_file: config.thresholds_file.clone(),
            stats,
            windows_processed: Arc::clone(&windows_processed),
        };

        Ok(Self {
            dst_live,
            src_live,
            protected,
            pipe,
            stop,
            blocking_handoff: config.mode == ClockMode::Offline,
            alert_rx,
            feedback_tx,
            windows_processed,
            worker: Some(worker),
            handle: None,
        })
    }

    /// Spawn the detection worker. Called once the first record has set the
    /// clock, so the learning deadline anchors to stream time.
    pub fn start(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.handle = Some(std::thread::spawn(move || worker.run()));
        }
    }

    /// Ingest one flow record into the live window.
    pub fn process_flow(&mut self, record: &FlowRecord) {
        ingest(
            &mut self.dst_live,
            &mut self.src_live,
            &self.protected,
            record,
        );
    }

    /// Close the live window: hand the sketch pair to the worker and reset.
    ///
    /// Online the handoff overwrites any unconsumed snapshot (newest wins);
    /// offline it waits for the slot so a fast replay drops nothing.
    pub fn end_window(&mut self) {
        self.hand_off(self.blocking_handoff);
    }

    /// Close the final window at end of stream.
    ///
    /// Both the data window and the empty padding window behind it use the
    /// blocking handoff regardless of mode: the second write returns only
    /// after the worker has taken the data window out of the slot, so the
    /// shutdown sentinel cannot overwrite it in either mode.
    pub fn flush(&mut self) {
        self.hand_off(true);
        self.hand_off(true);
    }

    fn hand_off(&mut self, blocking: bool) {
        let snapshot = WindowSnapshot {
            dst: self.dst_live.clone(),
            src: self.src_live.clone(),
        };
        if blocking {
            self.pipe.send_wait(snapshot);
        } else {
            self.pipe.send(snapshot);
        }
        self.dst_live.reset();
        self.src_live.reset();
        debug!("window handed to detection worker");
    }

    /// Next pending alert, if any.
    pub fn try_recv_alert(&self) -> Option<Alert> {
        self.alert_rx.try_recv().ok()
    }

    /// Feed an alert back as a false positive; applied by the worker at the
    /// start of its next window.
    pub fn report_false_positive(&self, alert: Alert) {
        let _ = self.feedback_tx.send(alert);
    }

    /// True when nothing has landed in the live window yet.
    pub fn live_window_empty(&self) -> bool {
        self.dst_live.is_empty() && self.src_live.is_empty()
    }

    /// Number of window snapshots the worker has fully analysed.
    pub fn windows_processed(&self) -> u64 {
        self.windows_processed.load(Ordering::SeqCst)
    }

    /// Stop the worker, join it, and hand back the alert receiver so the
    /// caller can drain alerts raised by the final windows.
    pub fn shutdown(self) -> Receiver<Alert> {
        let rx = self.alert_rx.clone();
        drop(self);
        rx
    }

    /// Whether a given address falls under a protected prefix.
    pub fn is_protected(&self, addr: Ipv4Addr) -> bool {
        self.protected.contains(addr)
    }
}

impl Drop for FloodDetector {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        // wake the worker with a final snapshot so it can persist and exit
        let snapshot = WindowSnapshot {
            dst: self.dst_live.clone(),
            src: self.src_live.clone(),
        };
        self.pipe.send(snapshot);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
