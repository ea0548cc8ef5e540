//! Threshold persistence
//!
//! One CSV row per destination-sketch column:
//! `bytes,packets,entropy_high,entropy_low,recv_sent_bytes,recv_sent_flows`.
//! Written on clean shutdown, loaded at startup when learning is disabled.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Calibrated thresholds for one sketch column.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ColumnThresholds {
    pub bytes: f64,
    pub packets: f64,
    pub entropy_high: f64,
    pub entropy_low: f64,
    pub recv_sent_bytes: f64,
    pub recv_sent_flows: f64,
}

/// Write one row per column.
pub fn store(path: &Path, rows: &[ColumnThresholds]) -> Result<()> {
    let mut out = String::with_capacity(rows.len() * 32);
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            row.bytes,
            row.packets,
            row.entropy_high,
            row.entropy_low,
            row.recv_sent_bytes,
            row.recv_sent_flows
        ));
    }
    fs::write(path, out)
        .with_context(|| format!("failed to write thresholds to {}", path.display()))
}

/// Read back exactly `expected` rows.
pub fn load(path: &Path, expected: usize) -> Result<Vec<ColumnThresholds>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read thresholds from {}", path.display()))?;
    let mut rows = Vec::with_capacity(expected);
    for (idx, line) in content.lines().enumerate() {
        let fields: Vec<f64> = line
            .split(',')
            .map(|field| {
                field
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("{}:{}: bad threshold value {:?}", path.display(), idx + 1, field))
            })
            .collect::<Result<_>>()?;
        if fields.len() != 6 {
            bail!(
                "{}:{}: expected 6 threshold columns, got {}",
                path.display(),
                idx + 1,
                fields.len()
            );
        }
        rows.push(ColumnThresholds {
            bytes: fields[0],
            packets: fields[1],
            entropy_high: fields[2],
            entropy_low: fields[3],
            recv_sent_bytes: fields[4],
            recv_sent_flows: fields[5],
        });
    }
    if rows.len() != expected {
        bail!(
            "{}: expected {} threshold rows (one per sketch column), got {}",
            path.display(),
            expected,
            rows.len()
        );
    }
    Ok(rows)
}
