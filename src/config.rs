//! Detector configuration
//!
//! Loaded from a TOML file and overridable from the command line. The
//! defaults mirror a sensible single-box deployment: 5-second windows,
//! 3-row sketches, a 0.75 calibration quantile and a 5-minute per-column
//! alert cooldown.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::clock::ClockMode;

/// Rows in both sketches.
pub const SKETCH_DEPTH: usize = 3;
/// Slack coefficient `c` of the CUSUM drift term.
pub const CUSUM_SLACK: f64 = 0.5;
/// Accumulation window length in seconds.
pub const WINDOW_SECS: i64 = 5;
/// How often the driver polls the feedback path for false positives.
pub const FEEDBACK_POLL_SECS: i64 = 60;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Time source: wall clock or capture replay.
    pub mode: ClockMode,

    /// Protected-prefix file (required).
    pub subnet_file: PathBuf,

    /// Optional whitelist file. Protected prefixes are always whitelisted
    /// as alert sources, whether or not this is set.
    pub whitelist_file: Option<PathBuf>,

    /// Learning duration, e.g. `30s`, `5m`, `1h`, `1d`. `0s` skips learning
    /// and loads previously persisted thresholds instead.
    pub learning: String,

    /// Quantile of learning-phase maxima used for columns that never fired.
    pub quantile: f64,

    /// EWMA span; alpha = 1 / (span + 1).
    pub span: u32,

    /// Destination sketch width (columns, one CUSUM bank entry each).
    pub dst_sketch_width: usize,

    /// Source sketch width.
    pub src_sketch_width: usize,

    /// Number of offending sources reported per alert.
    pub top_n: usize,

    /// Minimum seconds between alerts on the same column.
    pub alert_interval_secs: i64,

    /// Threshold persistence file.
    pub thresholds_file: PathBuf,

    /// Optional per-window statistics CSV for offline tuning.
    pub stats_file: Option<PathBuf>,

    /// Flow CSV input; stdin when unset.
    pub flow_file: Option<PathBuf>,

    /// Alert JSON-lines output; stdout when unset.
    pub alert_file: Option<PathBuf>,

    /// Feedback JSON-lines file polled for returned false positives.
    pub feedback_file: Option<PathBuf>,

    /// Base seed for the sketch hash rows; fixed so replays reproduce.
    pub sketch_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ClockMode::Online,
            subnet_file: PathBuf::new(),
            whitelist_file: None,
            learning: "0s".to_string(),
            quantile: 0.75,
            span: 60,
            dst_sketch_width: 1024,
            src_sketch_width: 32768,
            top_n: 5,
            alert_interval_secs: 300,
            thresholds_file: PathBuf::from("thresholds.csv"),
            stats_file: None,
            flow_file: None,
            alert_file: None,
            feedback_file: None,
            sketch_seed: 0x00D0_5DE7_EC70,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// EWMA smoothing factor derived from the span.
    pub fn alpha(&self) -> f64 {
        1.0 / (f64::from(self.span) + 1.0)
    }

    /// Learning duration in whole seconds.
    pub fn learning_secs(&self) -> Result<u64> {
        parse_duration(&self.learning)
            .with_context(|| format!("invalid learning duration: {:?}", self.learning))
    }

    /// Startup validation; anything wrong here refuses to start.
    pub fn validate(&self) -> Result<()> {
        let learning_secs = self.learning_secs()?;
        if !(0.0..=1.0).contains(&self.quantile) {
            bail!("quantile must be within [0, 1], got {}", self.quantile);
        }
        if self.dst_sketch_width == 0 || self.src_sketch_width == 0 {
            bail!("sketch widths must be non-zero");
        }
        if self.subnet_file.as_os_str().is_empty() {
            bail!("a protected-subnet file is required");
        }
        if !self.subnet_file.exists() {
            bail!("subnet file does not exist: {}", self.subnet_file.display());
        }
        if let Some(path) = &self.whitelist_file {
            if !path.exists() {
                bail!("whitelist file does not exist: {}", path.display());
            }
        }
        if learning_secs == 0 && !self.thresholds_file.exists() {
            bail!(
                "learning is disabled and no thresholds file found at {}; \
                 a learning run is required first",
                self.thresholds_file.display()
            );
        }
        Ok(())
    }
}

/// Parse `<number><unit>` durations: `s`, `m`, `h` or `d`. Fractional
/// numbers round up to whole seconds.
pub fn parse_duration(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.len() < 2 {
        bail!("duration too short: {:?}", text);
    }
    let (number, unit) = text.split_at(text.len() - 1);
    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid duration number: {:?}", number))?;
    if value < 0.0 {
        bail!("duration must be non-negative: {:?}", text);
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        other => bail!("unknown duration unit: {:?}", other),
    };
    Ok(secs.ceil() as u64)
}
