//! Normalised packet records
//!
//! A `PacketRecord` is the lightweight projection of a captured packet that
//! the rest of the pipeline works with: header metadata and timing only,
//! no payload bytes.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flag bit positions as they appear on the wire
pub mod flag_bits {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// Decoded TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & flag_bits::FIN != 0,
            syn: flags & flag_bits::SYN != 0,
            rst: flags & flag_bits::RST != 0,
            psh: flags & flag_bits::PSH != 0,
            ack: flags & flag_bits::ACK != 0,
            urg: flags & flag_bits::URG != 0,
            ece: flags & flag_bits::ECE != 0,
            cwr: flags & flag_bits::CWR != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= flag_bits::FIN; }
        if self.syn { flags |= flag_bits::SYN; }
        if self.rst { flags |= flag_bits::RST; }
        if self.psh { flags |= flag_bits::PSH; }
        if self.ack { flags |= flag_bits::ACK; }
        if self.urg { flags |= flag_bits::URG; }
        if self.ece { flags |= flag_bits::ECE; }
        if self.cwr { flags |= flag_bits::CWR; }
        flags
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Lightweight record of one captured IP packet
///
/// Lives only in the capture ring until the flow task drains it; never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Wall-clock arrival time, seconds since the Unix epoch
    pub timestamp: f64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Zero for ICMP and other port-less protocols
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    /// Full IP length in bytes (header + payload)
    pub size: u32,
    /// Raw TCP flag bitfield, 0 for non-TCP
    pub tcp_flags: u8,
    /// TCP receive window, 0 for non-TCP
    pub tcp_window: u16,
    /// Transport payload length in bytes
    pub payload_size: u32,
}

impl PacketRecord {
    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_u8(self.tcp_flags)
    }

    /// The endpoint tuple that sent this packet
    pub fn src_endpoint(&self) -> (IpAddr, u16) {
        (self.src_ip, self.src_port)
    }

    /// The endpoint tuple that received this packet
    pub fn dst_endpoint(&self) -> (IpAddr, u16) {
        (self.dst_ip, self.dst_port)
    }
}
