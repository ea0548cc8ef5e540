use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use floodwatch::{ClockMode, Config};

#[derive(Parser)]
#[command(name = "floodwatch")]
#[command(author, version, about = "NetFlow-based volumetric DoS/DDoS detector")]
pub struct Cli {
    /// Path to a TOML configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Time source: online (wall clock) or offline (capture replay)
    #[arg(short, long)]
    pub mode: Option<String>,

    /// File with subnets to protect
    #[arg(short = 'f', long)]
    pub subnet_file: Option<PathBuf>,

    /// Learning duration (e.g. 30s, 5m, 1h, 1d); 0s loads saved thresholds
    #[arg(short, long)]
    pub learning: Option<String>,

    /// Whitelist file; protected subnets are always whitelisted as sources
    #[arg(short, long)]
    pub whitelist: Option<PathBuf>,

    /// Quantile for calibrating columns that stayed silent while learning
    #[arg(short, long)]
    pub quantile: Option<f64>,

    /// Span of the CUSUM EWMA
    #[arg(short, long)]
    pub span: Option<u32>,

    /// Width of the destination sketch
    #[arg(short, long)]
    pub dst_sketch_width: Option<usize>,

    /// Width of the source sketch
    #[arg(short = 'k', long)]
    pub src_sketch_width: Option<usize>,

    /// Number of top source addresses reported per alert
    #[arg(short = 'n', long)]
    pub top_n: Option<usize>,

    /// Seconds between alerts for the same sketch column
    #[arg(short = 't', long)]
    pub alert_interval: Option<i64>,

    /// Flow CSV input file (stdin when omitted)
    #[arg(long)]
    pub flow_file: Option<PathBuf>,

    /// Alert JSON-lines output file (stdout when omitted)
    #[arg(long)]
    pub alert_file: Option<PathBuf>,

    /// Feedback JSON-lines file polled for returned false positives
    #[arg(long)]
    pub feedback_file: Option<PathBuf>,

    /// Threshold persistence file
    #[arg(long)]
    pub thresholds_file: Option<PathBuf>,

    /// Per-window statistics CSV for offline tuning
    #[arg(long)]
    pub stats_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Merge the config file (if any) with command-line overrides.
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = parse_mode(&mode)?;
        }
        if let Some(path) = self.subnet_file {
            config.subnet_file = path;
        }
        if let Some(learning) = self.learning {
            config.learning = learning;
        }
        if let Some(path) = self.whitelist {
            config.whitelist_file = Some(path);
        }
        if let Some(quantile) = self.quantile {
            config.quantile = quantile;
        }
        if let Some(span) = self.span {
            config.span = span;
        }
        if let Some(width) = self.dst_sketch_width {
            config.dst_sketch_width = width;
        }
        if let Some(width) = self.src_sketch_width {
            config.src_sketch_width = width;
        }
        if let Some(top_n) = self.top_n {
            config.top_n = top_n;
        }
        if let Some(interval) = self.alert_interval {
            config.alert_interval_secs = interval;
        }
        if let Some(path) = self.flow_file {
            config.flow_file = Some(path);
        }
        if let Some(path) = self.alert_file {
            config.alert_file = Some(path);
        }
        if let Some(path) = self.feedback_file {
            config.feedback_file = Some(path);
        }
        if let Some(path) = self.thresholds_file {
            config.thresholds_file = path;
        }
        if let Some(path) = self.stats_file {
            config.stats_file = Some(path);
        }

        Ok(config)
    }
}

fn parse_mode(text: &str) -> Result<ClockMode> {
    match text {
        "online" => Ok(ClockMode::Online),
        "offline" => Ok(ClockMode::Offline),
        other => bail!("invalid mode {:?}, expected online or offline", other),
    }
}

/// Build the config and run the detector to end of stream.
pub fn run_command(cli: Cli) -> Result<()> {
    let config = cli.into_config().context("invalid configuration")?;
    floodwatch::run(config)
}
