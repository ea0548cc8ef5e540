//! Shared data types: flow records and alert/feedback records.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mask selecting the /24 aggregate of a host-order IPv4 address.
pub const PREFIX24_MASK: u32 = 0xFFFF_FF00;

/// A single NetFlow record as delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub bytes: u64,
    pub packets: u64,
    pub timestamp: DateTime<Utc>,
}

impl FlowRecord {
    /// Source address as a host-order integer for sketching.
    pub fn src_bits(&self) -> u32 {
        u32::from(self.src)
    }

    /// Destination address as a host-order integer for sketching.
    pub fn dst_bits(&self) -> u32 {
        u32::from(self.dst)
    }
}

/// Alert emitted when all five per-column detectors fire at once.
///
/// The same shape travels the feedback path: an operator echoes an alert
/// back to declare it a false positive, and the measured values become the
/// new thresholds for that column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Victim /24 prefix (network address).
    pub dst_ip: Ipv4Addr,
    pub threshold_bytes: f64,
    pub threshold_packets: f64,
    pub threshold_entropy: f64,
    pub threshold_recv_sent_bytes: f64,
    pub threshold_recv_sent_flows: f64,
    pub measured_bytes: f64,
    pub measured_packets: f64,
    pub measured_entropy: f64,
    pub measured_recv_sent_bytes: f64,
    pub measured_recv_sent_flows: f64,
    /// Destination-sketch column that fired.
    pub cusum_id: u32,
    /// Heaviest non-whitelisted sources, most flows first.
    pub src_ips: Vec<Ipv4Addr>,
}
