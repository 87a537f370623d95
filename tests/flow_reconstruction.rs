//! Flow reconstruction scenarios

use std::net::{IpAddr, Ipv4Addr};

use netsentry::core::{flag_bits, CloseReason, FlowKey, IpProtocol, PacketRecord};
use netsentry::flow::{FlowBuilder, FlowConfig};

const CLIENT: [u8; 4] = [192, 168, 1, 100];
const SERVER: [u8; 4] = [10, 0, 0, 1];

fn packet(ts: f64, src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8) -> PacketRecord {
    PacketRecord {
        timestamp: ts,
        src_ip: IpAddr::V4(Ipv4Addr::from(src)),
        dst_ip: IpAddr::V4(Ipv4Addr::from(dst)),
        src_port: sport,
        dst_port: dport,
        protocol: IpProtocol::Tcp,
        size: 80,
        tcp_flags: flags,
        tcp_window: 1024,
        payload_size: 40,
    }
}

/// Interleaved traffic in both directions lands in one flow with the
/// initiator set by the first packet.
#[test]
fn bidirectional_interleave_shares_one_flow() {
    let mut builder = FlowBuilder::new(FlowConfig::default());

    let mut batch = Vec::new();
    for i in 0..10 {
        let t = i as f64 * 0.2;
        batch.push(packet(t, CLIENT, 44000, SERVER, 80, flag_bits::ACK));
        batch.push(packet(t + 0.1, SERVER, 80, CLIENT, 44000, flag_bits::ACK));
    }

    let completed = builder.ingest(batch);
    assert!(completed.is_empty());
    assert_eq!(builder.active_count(), 1);

    let flows = builder.force_complete_all();
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.fwd_packets.len() + flow.bwd_packets.len(), 20);
    assert_eq!(flow.fwd_packets.len(), 10);
    assert_eq!(flow.bwd_packets.len(), 10);
    // Initiator = sender of the first packet
    assert_eq!(flow.src_ip, IpAddr::V4(Ipv4Addr::from(CLIENT)));
    assert_eq!(flow.src_port, 44000);
}

/// One packet, then silence past the idle timeout.
#[test]
fn idle_timeout_closes_in_next_tick() {
    let mut builder = FlowBuilder::new(FlowConfig {
        idle_timeout: 120.0,
        ..FlowConfig::default()
    });

    builder.ingest(vec![packet(1000.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN)]);
    assert_eq!(builder.active_count(), 1);

    let completed = builder.poll_timeouts(1000.0 + 121.0);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].close_reason, Some(CloseReason::IdleTimeout));
    assert_eq!(builder.active_count(), 0);
}

/// Every ingested packet is counted into exactly one flow.
#[test]
fn every_packet_lands_in_one_flow() {
    let mut builder = FlowBuilder::new(FlowConfig::default());

    let mut batch = Vec::new();
    for port in 0..5u16 {
        for i in 0..4 {
            batch.push(packet(
                i as f64,
                CLIENT,
                40000 + port,
                SERVER,
                80,
                flag_bits::ACK,
            ));
        }
    }
    builder.ingest(batch);
    assert_eq!(builder.active_count(), 5);

    let flows = builder.force_complete_all();
    let total: usize = flows
        .iter()
        .map(|f| f.fwd_packets.len() + f.bwd_packets.len())
        .sum();
    assert_eq!(total, 20);
    assert_eq!(builder.stats().packets_processed, 20);
}

/// A→B and B→A always resolve to the same canonical key while active.
#[test]
fn canonical_key_symmetry() {
    let forward = packet(1.0, CLIENT, 44000, SERVER, 80, 0);
    let reverse = packet(2.0, SERVER, 80, CLIENT, 44000, 0);
    assert_eq!(
        FlowKey::from_record(&forward),
        FlowKey::from_record(&reverse)
    );

    let mut builder = FlowBuilder::new(FlowConfig::default());
    builder.ingest(vec![forward, reverse]);
    assert_eq!(builder.active_count(), 1);
}

/// The full TCP teardown: FIN both ways, then the final ACK.
#[test]
fn tcp_teardown_lifecycle() {
    let mut builder = FlowBuilder::new(FlowConfig::default());
    let completed = builder.ingest(vec![
        packet(1.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN),
        packet(1.1, SERVER, 80, CLIENT, 44000, flag_bits::SYN | flag_bits::ACK),
        packet(1.2, CLIENT, 44000, SERVER, 80, flag_bits::ACK),
        packet(5.0, CLIENT, 44000, SERVER, 80, flag_bits::FIN | flag_bits::ACK),
        packet(5.1, SERVER, 80, CLIENT, 44000, flag_bits::FIN | flag_bits::ACK),
        packet(5.2, CLIENT, 44000, SERVER, 80, flag_bits::ACK),
    ]);

    assert_eq!(completed.len(), 1);
    let flow = &completed[0];
    assert_eq!(flow.close_reason, Some(CloseReason::FinHandshake));
    assert!((flow.duration() - 4.2).abs() < 1e-9);
    assert_eq!(builder.active_count(), 0);
}

/// Traffic resuming on a completed key opens a distinct flow.
#[test]
fn new_flow_after_reset() {
    let mut builder = FlowBuilder::new(FlowConfig::default());
    let first = builder.ingest(vec![
        packet(1.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN),
        packet(1.1, SERVER, 80, CLIENT, 44000, flag_bits::RST),
    ]);
    assert_eq!(first.len(), 1);

    builder.ingest(vec![packet(2.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN)]);
    let flows = builder.force_complete_all();
    assert_eq!(flows.len(), 1);
    assert_ne!(flows[0].id, first[0].id);
}
