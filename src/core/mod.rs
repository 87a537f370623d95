//! Core domain types shared across the pipeline

pub mod flow;
pub mod packet;

pub use flow::{CloseReason, Flow, FlowKey, FlowPacket, FlowState};
pub use packet::{flag_bits, IpProtocol, PacketRecord, TcpFlags};
