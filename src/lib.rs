//! floodwatch: volumetric DoS/DDoS detection from NetFlow streams
//!
//! Per protected destination prefix, five traffic statistics are estimated
//! every window through a reversible Count-Min sketch pair, baselined with
//! adaptive CUSUM detectors, and an alert naming the victim /24 and its
//! top-N sources fires when all five exceed their learned thresholds.

pub mod clock;
pub mod config;
pub mod cusum;
pub mod detector;
pub mod models;
pub mod pipe;
pub mod prefix;
pub mod replay;
pub mod sketch;
pub mod thresholds;

use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

pub use clock::{Clock, ClockMode};
pub use config::Config;
pub use detector::FloodDetector;
pub use models::{Alert, FlowRecord};
pub use prefix::PrefixTrie;

use replay::{
    AlertSink, CsvFlowSource, FeedbackSource, FlowSource, JsonAlertSink, JsonFeedbackSource,
    NoFeedback,
};

/// Assemble the detector from a validated config and run the ingest loop
/// until the flow stream ends.
pub fn run(config: Config) -> Result<()> {
    config.validate()?;

    let protected = Arc::new(
        prefix::load_protected(&config.subnet_file).context("failed to load protected prefixes")?,
    );
    let whitelist = Arc::new(match &config.whitelist_file {
        Some(path) => prefix::load_whitelist(path).context("failed to load whitelist")?,
        None => PrefixTrie::new(),
    });
    info!(
        protected = protected.len(),
        whitelisted = whitelist.len(),
        mode = ?config.mode,
        learning = %config.learning,
        "starting detector"
    );

    let clock = Arc::new(Clock::new(config.mode));
    let detector = FloodDetector::new(&config, protected, whitelist, Arc::clone(&clock))?;

    let mut source: Box<dyn FlowSource> = match &config.flow_file {
        Some(path) => Box::new(CsvFlowSource::open(path)?),
        None => Box::new(CsvFlowSource::from_reader(BufReader::new(
            std::io::stdin().lock(),
        ))),
    };
    let mut sink: Box<dyn AlertSink> = match &config.alert_file {
        Some(path) => Box::new(JsonAlertSink::create(path)?),
        None => Box::new(JsonAlertSink::stdout()),
    };
    let mut feedback: Box<dyn FeedbackSource> = match &config.feedback_file {
        Some(path) => Box::new(JsonFeedbackSource::new(path.clone())),
        None => Box::new(NoFeedback),
    };

    replay::run_driver(
        detector,
        &clock,
        source.as_mut(),
        sink.as_mut(),
        feedback.as_mut(),
    )
}
