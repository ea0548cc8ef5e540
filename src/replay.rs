//! Flow transport and window driver
//!
//! The wire side of the detector: a CSV flow source (capture file or
//! stdin), a JSON-lines alert sink, and a JSON-lines feedback file that is
//! polled for returned false positives. `run_driver` is the ingest loop:
//! it advances the clock, tracks window boundaries, feeds the detector and
//! shuttles alerts/feedback between it and the transport.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{FEEDBACK_POLL_SECS, WINDOW_SECS};
use crate::detector::FloodDetector;
use crate::models::{Alert, FlowRecord};

/// Anything that yields flow records in stream order.
pub trait FlowSource {
    /// Next record, or `None` at end of stream.
    fn next_flow(&mut self) -> Result<Option<FlowRecord>>;
}

/// Destination for emitted alerts.
pub trait AlertSink {
    fn deliver(&mut self, alert: &Alert) -> Result<()>;
}

/// Source of returned false-positive descriptors.
pub trait FeedbackSource {
    fn poll(&mut self) -> Vec<Alert>;
}

/// CSV flow reader: `src,dst,bytes,packets,unix_ts` per line.
///
/// Malformed and non-IPv4 lines are dropped, matching the wire contract
/// that a bad record never stops the stream.
pub struct CsvFlowSource<R> {
    reader: R,
    line: String,
    lineno: usize,
}

impl CsvFlowSource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open flow file {}", path.display()))?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: BufRead> CsvFlowSource<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            lineno: 0,
        }
    }
}

fn parse_flow_line(line: &str) -> Option<FlowRecord> {
    let mut fields = line.split(',');
    let src: Ipv4Addr = fields.next()?.trim().parse().ok()?;
    let dst: Ipv4Addr = fields.next()?.trim().parse().ok()?;
    let bytes: u64 = fields.next()?.trim().parse().ok()?;
    let packets: u64 = fields.next()?.trim().parse().ok()?;
    let ts: f64 = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() || !ts.is_finite() || ts < 0.0 {
        return None;
    }
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract() * 1e9) as u32;
    let timestamp = DateTime::<Utc>::from_timestamp(secs, nanos)?;
    Some(FlowRecord {
        src,
        dst,
        bytes,
        packets,
        timestamp,
    })
}

impl<R: BufRead> FlowSource for CsvFlowSource<R> {
    fn next_flow(&mut self) -> Result<Option<FlowRecord>> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .context("failed to read flow line")?;
            if read == 0 {
                return Ok(None);
            }
            self.lineno += 1;
            let line = self.line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_flow_line(line) {
                Some(record) => return Ok(Some(record)),
                None => {
                    debug!(line = self.lineno, "dropped malformed flow record");
                }
            }
        }
    }
}

/// JSON-lines alert writer.
pub struct JsonAlertSink<W> {
    out: W,
}

impl JsonAlertSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl JsonAlertSink<File> {
    pub fn create(path: &Path) -> Result<Self> {
        let out = File::create(path)
            .with_context(|| format!("failed to create alert file {}", path.display()))?;
        Ok(Self { out })
    }
}

impl<W: Write> JsonAlertSink<W> {
    pub fn from_writer(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> AlertSink for JsonAlertSink<W> {
    fn deliver(&mut self, alert: &Alert) -> Result<()> {
        let json = serde_json::to_string(alert).context("failed to serialize alert")?;
        writeln!(self.out, "{}", json).context("failed to write alert")?;
        self.out.flush().ok();
        Ok(())
    }
}

/// Tail a JSON-lines file of returned alerts. Each poll picks up lines
/// appended since the previous one; a missing file simply yields nothing.
pub struct JsonFeedbackSource {
    path: PathBuf,
    offset: u64,
}

impl JsonFeedbackSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }
}

impl FeedbackSource for JsonFeedbackSource {
    fn poll(&mut self) -> Vec<Alert> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let mut content = String::new();
        if file.read_to_string(&mut content).is_err() {
            return Vec::new();
        }
        // only consume whole lines; a partial trailing write is re-read later
        let consumed = match content.rfind('\n') {
            Some(pos) => pos + 1,
            None => return Vec::new(),
        };
        self.offset += consumed as u64;

        let mut alerts = Vec::new();
        for line in content[..consumed].lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Alert>(line) {
                Ok(alert) => alerts.push(alert),
                Err(err) => warn!(error = %err, "dropped malformed feedback record"),
            }
        }
        alerts
    }
}

/// No-op feedback source for deployments without a feedback path.
pub struct NoFeedback;

impl FeedbackSource for NoFeedback {
    fn poll(&mut self) -> Vec<Alert> {
        Vec::new()
    }
}

/// Ingest loop: read flows until the stream ends, closing a window every
/// [`WINDOW_SECS`] of stream time.
///
/// The first window only anchors the boundary and its partial content is
/// discarded; real accumulation starts with the second. The detection
/// worker is started on the first record so its learning deadline anchors
/// to stream time.
pub fn run_driver(
    mut detector: FloodDetector,
    clock: &Clock,
    source: &mut dyn FlowSource,
    sink: &mut dyn AlertSink,
    feedback: &mut dyn FeedbackSource,
) -> Result<()> {
    let mut window_id: u32 = 0;
    let mut window_start = clock.now();
    let mut feedback_checked = clock.now();
    let mut records: u64 = 0;

    while let Some(record) = source.next_flow()? {
        records += 1;
        clock.advance(record.timestamp);
        let now = clock.now();

        if window_id == 0 {
            detector.start();
            window_start = now;
            feedback_checked = now;
            window_id = 1;
            debug!(window_id, "first window opened");
        } else {
            if window_id > 1 {
                detector.process_flow(&record);
            }
            if now >= window_start + Duration::seconds(WINDOW_SECS) {
                if window_id > 1 {
                    detector.end_window();
                }
                window_start = now;
                window_id += 1;
                debug!(window_id, "window boundary");
            }
        }

        while let Some(alert) = detector.try_recv_alert() {
            sink.deliver(&alert)?;
        }

        if now - feedback_checked > Duration::seconds(FEEDBACK_POLL_SECS) {
            feedback_checked = now;
            for fp in feedback.poll() {
                detector.report_false_positive(fp);
            }
        }
    }

    info!(records, windows = window_id, "flow stream ended");
    if window_id > 1 {
        detector.flush();
    }
    let remaining = detector.shutdown();
    while let Ok(alert) = remaining.try_recv() {
        sink.deliver(&alert)?;
    }
    Ok(())
}
