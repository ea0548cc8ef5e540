//! Per-window traffic metrics
//!
//! The five statistics fed into the CUSUM banks for every destination
//! column: raw byte and packet volume, the source/destination entropy
//! ratio, and the received-to-sent byte and flow ratios.

use crate::sketch::VictimCell;

/// Epsilon keeping the entropy ratio finite when either side is zero.
const ENTROPY_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub bytes: f64,
    pub packets: f64,
    pub entropy: f64,
    pub recv_sent_bytes: f64,
    pub recv_sent_flows: f64,
}

/// Normalised Shannon entropy of a tally vector, base `counts.len()`.
///
/// Fewer than two tallies carry no dispersion information and yield 0.
pub fn normalized_entropy(counts: &[u32]) -> f64 {
    if counts.len() < 2 {
        return 0.0;
    }
    let total: u64 = counts.iter().map(|&c| u64::from(c)).sum();
    if total == 0 {
        return 0.0;
    }
    let mut entropy = 0.0;
    for &count in counts {
        if count > 0 {
            let p = count as f64 / total as f64;
            entropy -= p * p.log2();
        }
    }
    entropy / (counts.len() as f64).log2()
}

/// Compute the five metrics from a recovered column: the accumulated cell
/// and the `(src_ip, flow_tally)` list walked out of the source sketch.
pub fn compute(acc: &VictimCell, sources: &[(u32, u32)]) -> WindowMetrics {
    let src_tallies: Vec<u32> = sources.iter().map(|&(_, tally)| tally).collect();
    let subnet_tallies: Vec<u32> = acc.ip_subnets().values().copied().collect();

    let entropy_sources = normalized_entropy(&src_tallies);
    let entropy_subnets = normalized_entropy(&subnet_tallies);
    let entropy = (entropy_sources + ENTROPY_EPSILON) / (entropy_subnets + ENTROPY_EPSILON);

    WindowMetrics {
        bytes: acc.byte_count() as f64,
        packets: acc.packet_count() as f64,
        entropy,
        recv_sent_bytes: (1.0 + acc.byte_count() as f64) / (1.0 + acc.sent_bytes() as f64),
        recv_sent_flows: (1.0 + f64::from(acc.flow_count())) / (1.0 + f64::from(acc.sent_flows())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlowRecord;
    use chrono::{TimeZone, Utc};
    use std::net::Ipv4Addr;

    #[test]
    fn test_entropy_degenerate_inputs() {
        assert_eq!(normalized_entropy(&[]), 0.0);
        assert_eq!(normalized_entropy(&[5]), 0.0);
        assert_eq!(normalized_entropy(&[0, 0]), 0.0);
    }

    #[test]
    fn test_entropy_uniform_is_one() {
        let entropy = normalized_entropy(&[10, 10, 10, 10]);
        assert!((entropy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_skew_lowers_value() {
        let uniform = normalized_entropy(&[25, 25, 25, 25]);
        let skewed = normalized_entropy(&[97, 1, 1, 1]);
        assert!(skewed < uniform);
        assert!(skewed > 0.0);
    }

    #[test]
    fn test_entropy_ignores_zero_tallies() {
        let with_zero = normalized_entropy(&[50, 50, 0]);
        assert!(with_zero.is_finite());
        assert!(with_zero > 0.0);
    }

    #[test]
    fn test_ratios_are_laplace_smoothed() {
        let acc = VictimCell::new();
        let metrics = compute(&acc, &[]);
        assert_eq!(metrics.recv_sent_bytes, 1.0);
        assert_eq!(metrics.recv_sent_flows, 1.0);
        assert_eq!(metrics.bytes, 0.0);
    }

    #[test]
    fn test_receive_only_traffic_raises_ratios() {
        let mut acc = VictimCell::new();
        for _ in 0..9 {
            acc.update(&FlowRecord {
                src: Ipv4Addr::new(198, 51, 100, 1),
                dst: Ipv4Addr::new(10, 0, 0, 1),
                bytes: 111,
                packets: 1,
                timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            });
        }
        let metrics = compute(&acc, &[(0xC633_6401, 9)]);
        assert_eq!(metrics.bytes, 999.0);
        assert_eq!(metrics.packets, 9.0);
        assert_eq!(metrics.recv_sent_bytes, 1000.0);
        assert_eq!(metrics.recv_sent_flows, 10.0);
    }

    #[test]
    fn test_distributed_sources_raise_entropy_metric() {
        let mut acc = VictimCell::new();
        acc.update(&FlowRecord {
            src: Ipv4Addr::new(198, 51, 100, 1),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            bytes: 100,
            packets: 1,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        });
        let concentrated = compute(&acc, &[(1, 100), (2, 1)]);
        let distributed = compute(&acc, &[(1, 50), (2, 50)]);
        assert!(distributed.entropy > concentrated.entropy);
    }
}
