//! End-to-end detection scenarios
//!
//! Drives the detector in offline mode with synthetic traffic, one window
//! at a time, in lockstep with the detection worker: after every window
//! the test waits until the worker has analysed it, so clock-dependent
//! behavior (learning end, calibration, cooldowns) is deterministic.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::TempDir;

use floodwatch::config::{Config, WINDOW_SECS};
use floodwatch::{Alert, Clock, ClockMode, FloodDetector, FlowRecord, PrefixTrie};

const VICTIM: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn base_config(dir: &TempDir, learning_windows: u32) -> Config {
    Config {
        mode: ClockMode::Offline,
        learning: format!("{}s", i64::from(learning_windows) * WINDOW_SECS),
        quantile: 0.75,
        span: 10,
        dst_sketch_width: 64,
        src_sketch_width: 8192,
        top_n: 5,
        alert_interval_secs: 0,
        thresholds_file: dir.path().join("thresholds.csv"),
        sketch_seed: 0xBEEF,
        ..Default::default()
    }
}

fn protected_trie() -> PrefixTrie {
    let mut trie = PrefixTrie::new();
    // default sensitivity 0.5 -> multiplier 100 * 0.015^0.5
    trie.insert("10.0.0.0/24".parse().unwrap(), Some(100.0 * 0.015f64.sqrt()));
    trie
}

struct Harness {
    detector: Option<FloodDetector>,
    clock: Arc<Clock>,
    now: DateTime<Utc>,
    windows_sent: u64,
}

impl Harness {
    fn new(config: &Config, protected: PrefixTrie, whitelist: PrefixTrie) -> Self {
        let clock = Arc::new(Clock::new(ClockMode::Offline));
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        clock.advance(start);
        let mut detector = FloodDetector::new(
            config,
            Arc::new(protected),
            Arc::new(whitelist),
            Arc::clone(&clock),
        )
        .expect("detector construction");
        detector.start();
        Self {
            detector: Some(detector),
            clock,
            now: start,
            windows_sent: 0,
        }
    }

    fn detector(&self) -> &FloodDetector {
        self.detector.as_ref().unwrap()
    }

    fn flow(&self, src: Ipv4Addr, dst: Ipv4Addr, bytes: u64) -> FlowRecord {
        FlowRecord {
            src,
            dst,
            bytes,
            packets: 1,
            timestamp: self.now,
        }
    }

    /// Feed one window of flows, close it, and wait for its analysis.
    fn window(&mut self, flows: &[FlowRecord]) {
        let detector = self.detector.as_mut().unwrap();
        for flow in flows {
            detector.process_flow(flow);
        }
        self.now = self.now + Duration::seconds(WINDOW_SECS);
        self.clock.advance(self.now);
        detector.end_window();
        self.windows_sent += 1;

        let deadline = Instant::now() + StdDuration::from_secs(10);
        while self.detector().windows_processed() < self.windows_sent {
            assert!(Instant::now() < deadline, "detection worker stalled");
            std::thread::sleep(StdDuration::from_millis(1));
        }
    }

    fn try_alert(&self) -> Option<Alert> {
        self.detector().try_recv_alert()
    }

    fn drain_alerts(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Some(alert) = self.try_alert() {
            alerts.push(alert);
        }
        alerts
    }

    fn shutdown(&mut self) {
        if let Some(detector) = self.detector.take() {
            detector.shutdown();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn baseline_source(i: u32) -> Ipv4Addr {
    Ipv4Addr::new(198, 51, 100, (i % 250 + 1) as u8)
}

fn attacker(i: u32) -> Ipv4Addr {
    Ipv4Addr::new(100, 64, (i / 250) as u8, (i % 250 + 1) as u8)
}

/// ~100 inbound flows from 50 sources with skewed tallies, plus victim
/// responses so the sent-side ratios have a baseline.
fn baseline_window(harness: &Harness, window: u32) -> Vec<FlowRecord> {
    let mut flows = Vec::new();
    for i in 0..50 {
        let src = baseline_source(i);
        let bytes = 1000 + u64::from((window + i) % 5) * 40;
        for _ in 0..(1 + i % 3) {
            flows.push(harness.flow(src, VICTIM, bytes));
        }
        flows.push(harness.flow(VICTIM, src, 500));
    }
    flows
}

/// Baseline plus 10 000 flows from 500 fresh sources, interleaved.
fn attack_window(harness: &Harness, window: u32) -> Vec<FlowRecord> {
    let mut flows = baseline_window(harness, window);
    for i in 0..500 {
        let src = attacker(i);
        for _ in 0..20 {
            flows.push(harness.flow(src, VICTIM, 1500));
        }
    }
    let mut rng = StdRng::seed_from_u64(u64::from(window));
    flows.shuffle(&mut rng);
    flows
}

fn run_learning(harness: &mut Harness, windows: u32) {
    for window in 0..windows {
        harness.window(&baseline_window(harness, window));
    }
    assert!(
        harness.drain_alerts().is_empty(),
        "no alert may fire during learning"
    );
}

/// Inject attack windows until an alert fires; returns (alert, windows used).
fn attack_until_alert(harness: &mut Harness, max_windows: u32) -> (Alert, u32) {
    for window in 0..max_windows {
        harness.window(&attack_window(&harness, window));
        if let Some(alert) = harness.try_alert() {
            return (alert, window + 1);
        }
    }
    panic!("no alert after {} attack windows", max_windows);
}

#[test]
fn test_single_heavy_victim_raises_one_alert() {
    let dir = TempDir::new().unwrap();
    let config = base_config(&dir, 31);
    let mut harness = Harness::new(&config, protected_trie(), PrefixTrie::new());

    run_learning(&mut harness, 31);
    let (alert, _) = attack_until_alert(&mut harness, 10);

    assert_eq!(alert.dst_ip, Ipv4Addr::new(10, 0, 0, 0));
    assert_eq!(alert.src_ips.len(), 5);
    for src in &alert.src_ips {
        assert_eq!(
            (src.octets()[0], src.octets()[1]),
            (100, 64),
            "top source {} is not one of the attackers",
            src
        );
    }
    assert!(alert.measured_bytes > alert.threshold_bytes);
    assert!(alert.measured_packets > alert.threshold_packets);
}

#[test]
fn test_whitelisted_source_never_reported() {
    let dir = TempDir::new().unwrap();
    let config = base_config(&dir, 31);
    let heavy = attacker(0);
    let mut whitelist = PrefixTrie::new();
    whitelist.insert(format!("{}/32", heavy).parse().unwrap(), None);
    let mut harness = Harness::new(&config, protected_trie(), whitelist);

    run_learning(&mut harness, 31);

    // make the whitelisted source by far the heaviest
    for window in 0..10 {
        let mut flows = attack_window(&harness, window);
        for _ in 0..200 {
            flows.push(harness.flow(heavy, VICTIM, 1500));
        }
        harness.window(&flows);
        if let Some(alert) = harness.try_alert() {
            assert!(
                !alert.src_ips.contains(&heavy),
                "whitelisted source {} leaked into the alert",
                heavy
            );
            assert!(!alert.src_ips.is_empty());
            return;
        }
    }
    panic!("no alert fired");
}

#[test]
fn test_distributed_low_bandwidth_flood_detected() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir, 31);
    config.src_sketch_width = 32768;
    let mut harness = Harness::new(&config, protected_trie(), PrefixTrie::new());

    // heavy-tailed baseline: one chatty client and 49 quiet ones
    let chatty = baseline_source(0);
    for window in 0..31 {
        let mut flows = Vec::new();
        for _ in 0..1900 {
            flows.push(harness.flow(chatty, VICTIM, 1500));
        }
        for i in 1..50 {
            let bytes = 1400 + u64::from((window + i) % 4) * 50;
            flows.push(harness.flow(baseline_source(i), VICTIM, bytes));
            flows.push(harness.flow(baseline_source(i), VICTIM, bytes));
            flows.push(harness.flow(VICTIM, baseline_source(i), 700));
        }
        harness.window(&flows);
    }
    assert!(harness.drain_alerts().is_empty());

    // 5000 sources, one small flow each, on top of the baseline
    for window in 0..10 {
        let mut flows = Vec::new();
        for _ in 0..1900 {
            flows.push(harness.flow(chatty, VICTIM, 1500));
        }
        for i in 1..50 {
            flows.push(harness.flow(baseline_source(i), VICTIM, 1400));
            flows.push(harness.flow(baseline_source(i), VICTIM, 1400));
            flows.push(harness.flow(VICTIM, baseline_source(i), 700));
        }
        for i in 0..5000 {
            flows.push(harness.flow(attacker(i), VICTIM, 200));
        }
        harness.window(&flows);
        if let Some(alert) = harness.try_alert() {
            assert_eq!(alert.dst_ip, Ipv4Addr::new(10, 0, 0, 0));
            assert!(alert.measured_entropy > alert.threshold_entropy);
            assert!(alert.measured_recv_sent_flows > alert.threshold_recv_sent_flows);
            return;
        }
    }
    panic!("distributed flood was not detected");
}

#[test]
fn test_false_positive_feedback_suppresses_rerun() {
    let dir = TempDir::new().unwrap();
    let config = base_config(&dir, 31);
    let mut harness = Harness::new(&config, protected_trie(), PrefixTrie::new());

    run_learning(&mut harness, 31);
    let (alert, attack_windows) = attack_until_alert(&mut harness, 10);

    // operator calls it a false positive
    harness.detector().report_false_positive(alert.clone());

    // let the traffic fall back to baseline and the arms drain
    for window in 0..40 {
        harness.window(&baseline_window(&harness, window));
    }
    harness.drain_alerts();

    // the identical pattern must now stay below the widened thresholds
    for window in 0..attack_windows {
        harness.window(&attack_window(&harness, window));
        assert!(
            harness.try_alert().is_none(),
            "alert fired again after false-positive feedback"
        );
    }
}

#[test]
fn test_shutdown_mid_learning_persists_thresholds() {
    let dir = TempDir::new().unwrap();
    let config = base_config(&dir, 720); // 1 h learning
    let mut harness = Harness::new(&config, protected_trie(), PrefixTrie::new());

    for window in 0..2 {
        harness.window(&baseline_window(&harness, window));
    }
    harness.shutdown();

    let rows = floodwatch::thresholds::load(&config.thresholds_file, config.dst_sketch_width)
        .expect("thresholds persisted on shutdown");
    assert_eq!(rows.len(), config.dst_sketch_width);

    // a restart without learning must accept the persisted file
    let restart_config = base_config(&dir, 0);
    let restarted = FloodDetector::new(
        &restart_config,
        Arc::new(protected_trie()),
        Arc::new(PrefixTrie::new()),
        Arc::new(Clock::new(ClockMode::Offline)),
    );
    assert!(restarted.is_ok());
}

#[test]
fn test_unprotected_traffic_produces_nothing() {
    let dir = TempDir::new().unwrap();
    let config = base_config(&dir, 2);
    let mut harness = Harness::new(&config, protected_trie(), PrefixTrie::new());

    let outsider = Ipv4Addr::new(172, 16, 0, 1);
    for window in 0..5 {
        let flows: Vec<FlowRecord> = (0..100)
            .map(|i| harness.flow(baseline_source(i), outsider, 1500))
            .collect();
        let detector = harness.detector.as_mut().unwrap();
        for flow in &flows {
            detector.process_flow(flow);
        }
        assert!(
            detector.live_window_empty(),
            "unprotected traffic leaked into the sketches (window {})",
            window
        );
        harness.window(&[]);
    }
    assert!(harness.drain_alerts().is_empty());
}
