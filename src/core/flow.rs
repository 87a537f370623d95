//! Bidirectional flow tracking
//!
//! A flow groups every packet sharing one canonical 5-tuple. Direction is
//! decided against the initiator endpoint (the sender of the first packet);
//! per-direction packet summaries feed the feature extractor once the flow
//! completes.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::packet::{flag_bits, IpProtocol, PacketRecord};

/// Canonical 5-tuple flow key
///
/// Endpoints are sorted so that A→B and B→A hash to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub addr_a: IpAddr,
    pub port_a: u16,
    pub addr_b: IpAddr,
    pub port_b: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn from_record(rec: &PacketRecord) -> Self {
        let src = (rec.src_ip, rec.src_port);
        let dst = (rec.dst_ip, rec.dst_port);
        if src <= dst {
            Self {
                addr_a: src.0,
                port_a: src.1,
                addr_b: dst.0,
                port_b: dst.1,
                protocol: rec.protocol.into(),
            }
        } else {
            Self {
                addr_a: dst.0,
                port_a: dst.1,
                addr_b: src.0,
                port_b: src.1,
                protocol: rec.protocol.into(),
            }
        }
    }
}

/// Flow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Active,
    Complete,
}

/// Why a flow transitioned to `Complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// No packet for the idle timeout window
    IdleTimeout,
    /// RST observed on either side
    Reset,
    /// FIN seen in both directions, then an ACK
    FinHandshake,
    /// Flow exceeded the maximum duration cap
    DurationCap,
    /// Flushed at shutdown
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Reset => "reset",
            CloseReason::FinHandshake => "fin_handshake",
            CloseReason::DurationCap => "duration_cap",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Per-packet summary kept on each direction of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPacket {
    pub timestamp: f64,
    pub size: u32,
    pub tcp_flags: u8,
    pub tcp_window: u16,
    pub payload_size: u32,
}

impl FlowPacket {
    fn from_record(rec: &PacketRecord) -> Self {
        Self {
            timestamp: rec.timestamp,
            size: rec.size,
            tcp_flags: rec.tcp_flags,
            tcp_window: rec.tcp_window,
            payload_size: rec.payload_size,
        }
    }
}

/// A bidirectional network flow
#[derive(Debug, Clone)]
pub struct Flow {
    /// Persisted primary key
    pub id: Uuid,
    pub key: FlowKey,

    // Initiator endpoint = sender of the first packet
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: IpProtocol,

    pub state: FlowState,
    pub close_reason: Option<CloseReason>,

    pub start_time: f64,
    pub last_time: f64,

    /// Packets sent by the initiator
    pub fwd_packets: Vec<FlowPacket>,
    /// Packets sent by the responder
    pub bwd_packets: Vec<FlowPacket>,
    pub fwd_bytes: u64,
    pub bwd_bytes: u64,

    // TCP teardown tracking
    pub fin_fwd: bool,
    pub fin_bwd: bool,
}

impl Flow {
    /// Create a new flow from its first packet
    pub fn new(first: &PacketRecord) -> Self {
        let key = FlowKey::from_record(first);
        let mut flow = Self {
            id: Uuid::new_v4(),
            key,
            src_ip: first.src_ip,
            src_port: first.src_port,
            dst_ip: first.dst_ip,
            dst_port: first.dst_port,
            protocol: first.protocol,
            state: FlowState::Active,
            close_reason: None,
            start_time: first.timestamp,
            last_time: first.timestamp,
            fwd_packets: Vec::new(),
            bwd_packets: Vec::new(),
            fwd_bytes: 0,
            bwd_bytes: 0,
            fin_fwd: false,
            fin_bwd: false,
        };
        flow.push(first);
        flow
    }

    /// Add a packet, deciding its direction against the initiator endpoint
    ///
    /// Returns true if the packet went forward (initiator → responder).
    pub fn push(&mut self, rec: &PacketRecord) -> bool {
        let is_forward = rec.src_endpoint() == (self.src_ip, self.src_port);

        let summary = FlowPacket::from_record(rec);
        if is_forward {
            self.fwd_bytes += rec.size as u64;
            self.fwd_packets.push(summary);
            if rec.tcp_flags & flag_bits::FIN != 0 {
                self.fin_fwd = true;
            }
        } else {
            self.bwd_bytes += rec.size as u64;
            self.bwd_packets.push(summary);
            if rec.tcp_flags & flag_bits::FIN != 0 {
                self.fin_bwd = true;
            }
        }

        if rec.timestamp > self.last_time {
            self.last_time = rec.timestamp;
        }
        is_forward
    }

    /// Mark the flow complete; terminal
    pub fn complete(&mut self, reason: CloseReason) {
        self.state = FlowState::Complete;
        self.close_reason = Some(reason);
    }

    pub fn is_complete(&self) -> bool {
        self.state == FlowState::Complete
    }

    /// Flow duration in seconds, never negative
    pub fn duration(&self) -> f64 {
        (self.last_time - self.start_time).max(0.0)
    }

    pub fn total_packets(&self) -> u64 {
        (self.fwd_packets.len() + self.bwd_packets.len()) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.fwd_bytes + self.bwd_bytes
    }

    /// Seconds since the last packet
    pub fn idle_for(&self, now: f64) -> f64 {
        (now - self.last_time).max(0.0)
    }
}
