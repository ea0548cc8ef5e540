//! Per-destination aggregate cell
//!
//! The value stored in every destination-sketch cell. Besides the plain
//! byte/packet/flow tallies it carries:
//! - a [`BitCount`] so the dominant destination address can be peeled back
//!   out of a colliding cell,
//! - `communicated_with`, a source-column → flow-tally map filled in by the
//!   ingest stage and used to walk back into the source sketch,
//! - `ip_subnets`, a top-octet histogram of destination addresses feeding
//!   the entropy metric.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::bitcount::BitCount;
use crate::models::FlowRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VictimCell {
    byte_count: u64,
    packet_count: u64,
    flow_count: u32,
    sent_bytes: u64,
    sent_flows: u32,
    reversible_key: BitCount,
    communicated_with: HashMap<u32, u32>,
    ip_subnets: BTreeMap<u8, u32>,
}

impl VictimCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one inbound flow for this destination.
    pub fn update(&mut self, record: &FlowRecord) {
        let dst = record.dst_bits();
        *self.ip_subnets.entry((dst >> 24) as u8).or_insert(0) += 1;
        self.reversible_key.update(dst, 1);
        self.byte_count = self.byte_count.saturating_add(record.bytes);
        self.packet_count = self.packet_count.saturating_add(record.packets);
        self.flow_count = self.flow_count.saturating_add(1);
    }

    /// Account one outbound flow (the protected side is the sender).
    pub fn update_sent_bytes(&mut self, bytes: u64) {
        self.sent_bytes = self.sent_bytes.saturating_add(bytes);
        self.sent_flows = self.sent_flows.saturating_add(1);
    }

    /// Bump the flow tally for a source-sketch column index.
    pub fn update_flow_counter(&mut self, src_idx: u32) {
        *self.communicated_with.entry(src_idx).or_insert(0) += 1;
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn flow_count(&self) -> u32 {
        self.flow_count
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn sent_flows(&self) -> u32 {
        self.sent_flows
    }

    /// Dominant destination address by per-bit majority.
    pub fn reverse_key(&self) -> u32 {
        self.reversible_key.reverse_key()
    }

    pub fn communicated_with(&self) -> &HashMap<u32, u32> {
        &self.communicated_with
    }

    pub fn ip_subnets(&self) -> &BTreeMap<u8, u32> {
        &self.ip_subnets
    }

    /// Field-wise addition; maps merge by summing tallies.
    pub fn merge(&mut self, other: &Self) {
        self.reversible_key.merge(&other.reversible_key);
        self.byte_count = self.byte_count.saturating_add(other.byte_count);
        self.packet_count = self.packet_count.saturating_add(other.packet_count);
        self.flow_count = self.flow_count.saturating_add(other.flow_count);
        self.sent_bytes = self.sent_bytes.saturating_add(other.sent_bytes);
        self.sent_flows = self.sent_flows.saturating_add(other.sent_flows);
        for (&octet, &count) in &other.ip_subnets {
            *self.ip_subnets.entry(octet).or_insert(0) += count;
        }
        for (&idx, &count) in &other.communicated_with {
            *self.communicated_with.entry(idx).or_insert(0) += count;
        }
    }

    /// Field-wise saturating subtraction; a map key drained to zero or
    /// below is removed.
    pub fn saturating_sub_assign(&mut self, other: &Self) {
        self.reversible_key.saturating_sub_assign(&other.reversible_key);
        self.byte_count = self.byte_count.saturating_sub(other.byte_count);
        self.packet_count = self.packet_count.saturating_sub(other.packet_count);
        self.flow_count = self.flow_count.saturating_sub(other.flow_count);
        self.sent_bytes = self.sent_bytes.saturating_sub(other.sent_bytes);
        self.sent_flows = self.sent_flows.saturating_sub(other.sent_flows);
        for (&idx, &count) in &other.communicated_with {
            if let Some(mine) = self.communicated_with.get_mut(&idx) {
                if *mine > count {
                    *mine -= count;
                } else {
                    self.communicated_with.remove(&idx);
                }
            }
        }
        for (&octet, &count) in &other.ip_subnets {
            if let Some(mine) = self.ip_subnets.get_mut(&octet) {
                if *mine > count {
                    *mine -= count;
                } else {
                    self.ip_subnets.remove(&octet);
                }
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
