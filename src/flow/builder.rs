//! Bidirectional flow reconstruction with timeout-driven closure

use std::collections::HashMap;

use tracing::debug;

use crate::core::{flag_bits, CloseReason, Flow, FlowKey, IpProtocol, PacketRecord};

use super::{BuilderStats, FlowConfig};

/// Reconstructs flows from batches of packet records
///
/// Exclusively owned by the flow task; completed flows are handed off and
/// never mutated again. A completed key starts a fresh flow on the next
/// packet that hashes to it.
pub struct FlowBuilder {
    config: FlowConfig,
    flows: HashMap<FlowKey, Flow>,
    stats: BuilderStats,
}

impl FlowBuilder {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            flows: HashMap::with_capacity(config.table_size.min(4096)),
            config,
            stats: BuilderStats::default(),
        }
    }

    /// Ingest a batch of packet records, returning flows completed by it
    ///
    /// The batch is ordered by timestamp first so that simultaneous opening
    /// packets elect the initiator deterministically; equal timestamps fall
    /// back to the lexicographically lower endpoint tuple.
    pub fn ingest(&mut self, mut batch: Vec<PacketRecord>) -> Vec<Flow> {
        batch.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.src_endpoint().cmp(&b.src_endpoint()))
        });

        let mut completed = Vec::new();
        for rec in batch {
            if let Some(flow) = self.process(rec) {
                completed.push(flow);
            }
        }
        completed
    }

    /// Feed one packet; returns the flow if this packet completed it
    fn process(&mut self, rec: PacketRecord) -> Option<Flow> {
        self.stats.packets_processed += 1;
        let key = FlowKey::from_record(&rec);
        let is_tcp = rec.protocol == IpProtocol::Tcp;

        if !self.flows.contains_key(&key) {
            if self.flows.len() >= self.config.table_size {
                self.evict_oldest();
            }
            self.stats.flows_created += 1;
            let mut flow = Flow::new(&rec);

            // A lone RST still opens and immediately closes a flow
            if is_tcp && rec.tcp_flags & flag_bits::RST != 0 {
                flow.complete(CloseReason::Reset);
                self.stats.flows_completed += 1;
                return Some(flow);
            }
            self.flows.insert(key, flow);
            return None;
        }

        let flow = self.flows.get_mut(&key).expect("flow present after contains_key");

        // Final ACK of the FIN/FIN exchange is detected before updating
        // flags, so the closing ACK is still counted into the flow.
        let fin_close =
            flow.fin_fwd && flow.fin_bwd && is_tcp && rec.tcp_flags & flag_bits::ACK != 0;

        flow.push(&rec);

        if is_tcp && rec.tcp_flags & flag_bits::RST != 0 {
            flow.complete(CloseReason::Reset);
        } else if fin_close {
            flow.complete(CloseReason::FinHandshake);
        } else if flow.duration() >= self.config.max_duration {
            flow.complete(CloseReason::DurationCap);
        }

        if flow.is_complete() {
            self.take(&key)
        } else {
            None
        }
    }

    /// Close flows idle past the timeout; evaluated against the caller's clock
    pub fn poll_timeouts(&mut self, now: f64) -> Vec<Flow> {
        let timeout = self.config.idle_timeout;
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.idle_for(now) > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        let mut completed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(mut flow) = self.flows.remove(&key) {
                flow.complete(CloseReason::IdleTimeout);
                self.stats.flows_completed += 1;
                completed.push(flow);
            }
        }

        if !completed.is_empty() {
            debug!("{} flows closed by idle timeout", completed.len());
        }
        completed
    }

    /// Flush every active flow, e.g. at shutdown
    pub fn force_complete_all(&mut self) -> Vec<Flow> {
        let mut completed: Vec<Flow> = self
            .flows
            .drain()
            .map(|(_, mut flow)| {
                flow.complete(CloseReason::Shutdown);
                flow
            })
            .collect();
        completed.sort_by(|a, b| {
            a.start_time
                .partial_cmp(&b.start_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.stats.flows_completed += completed.len() as u64;
        completed
    }

    pub fn active_count(&self) -> usize {
        self.flows.len()
    }

    pub fn stats(&self) -> BuilderStats {
        self.stats
    }

    fn take(&mut self, key: &FlowKey) -> Option<Flow> {
        let flow = self.flows.remove(key);
        if flow.is_some() {
            self.stats.flows_completed += 1;
        }
        flow
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .flows
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_time
                    .partial_cmp(&b.last_time)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(key, _)| key.clone())
        {
            self.flows.remove(&key);
            self.stats.flows_evicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tcp_record(
        ts: f64,
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        flags: u8,
    ) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            src_ip: IpAddr::V4(Ipv4Addr::from(src)),
            dst_ip: IpAddr::V4(Ipv4Addr::from(dst)),
            src_port: sport,
            dst_port: dport,
            protocol: IpProtocol::Tcp,
            size: 60,
            tcp_flags: flags,
            tcp_window: 1024,
            payload_size: 0,
        }
    }

    const CLIENT: [u8; 4] = [192, 168, 1, 100];
    const SERVER: [u8; 4] = [10, 0, 0, 1];

    #[test]
    fn test_both_directions_share_flow() {
        let mut builder = FlowBuilder::new(FlowConfig::default());
        let completed = builder.ingest(vec![
            tcp_record(1.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN),
            tcp_record(1.1, SERVER, 80, CLIENT, 44000, flag_bits::SYN | flag_bits::ACK),
            tcp_record(1.2, CLIENT, 44000, SERVER, 80, flag_bits::ACK),
        ]);
        assert!(completed.is_empty());
        assert_eq!(builder.active_count(), 1);
    }

    #[test]
    fn test_rst_closes_flow() {
        let mut builder = FlowBuilder::new(FlowConfig::default());
        builder.ingest(vec![tcp_record(1.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN)]);

        let completed = builder.ingest(vec![tcp_record(
            1.5,
            SERVER,
            80,
            CLIENT,
            44000,
            flag_bits::RST,
        )]);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].close_reason, Some(CloseReason::Reset));
        assert_eq!(builder.active_count(), 0);
    }

    #[test]
    fn test_fin_both_sides_then_ack_closes() {
        let mut builder = FlowBuilder::new(FlowConfig::default());
        let mut completed = builder.ingest(vec![
            tcp_record(1.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN),
            tcp_record(1.1, SERVER, 80, CLIENT, 44000, flag_bits::SYN | flag_bits::ACK),
            tcp_record(1.2, CLIENT, 44000, SERVER, 80, flag_bits::ACK),
            tcp_record(2.0, CLIENT, 44000, SERVER, 80, flag_bits::FIN | flag_bits::ACK),
            tcp_record(2.1, SERVER, 80, CLIENT, 44000, flag_bits::FIN | flag_bits::ACK),
        ]);
        // Both FINs seen; final ACK still outstanding
        assert!(completed.is_empty());

        completed = builder.ingest(vec![tcp_record(
            2.2,
            CLIENT,
            44000,
            SERVER,
            80,
            flag_bits::ACK,
        )]);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].close_reason, Some(CloseReason::FinHandshake));
        // The closing ACK belongs to the flow
        assert_eq!(completed[0].total_packets(), 6);
    }

    #[test]
    fn test_idle_timeout() {
        let mut builder = FlowBuilder::new(FlowConfig::default());
        builder.ingest(vec![tcp_record(100.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN)]);

        // At exactly the timeout nothing closes yet
        assert!(builder.poll_timeouts(220.0).is_empty());

        let completed = builder.poll_timeouts(221.0);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].close_reason, Some(CloseReason::IdleTimeout));
        assert_eq!(builder.active_count(), 0);
    }

    #[test]
    fn test_duration_cap() {
        let mut builder = FlowBuilder::new(FlowConfig {
            max_duration: 10.0,
            ..FlowConfig::default()
        });
        builder.ingest(vec![tcp_record(0.0, CLIENT, 44000, SERVER, 80, flag_bits::ACK)]);
        let completed = builder.ingest(vec![tcp_record(
            11.0,
            CLIENT,
            44000,
            SERVER,
            80,
            flag_bits::ACK,
        )]);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].close_reason, Some(CloseReason::DurationCap));
    }

    #[test]
    fn test_completed_key_starts_new_flow() {
        let mut builder = FlowBuilder::new(FlowConfig::default());
        builder.ingest(vec![
            tcp_record(1.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN),
            tcp_record(1.5, SERVER, 80, CLIENT, 44000, flag_bits::RST),
        ]);
        assert_eq!(builder.active_count(), 0);

        builder.ingest(vec![tcp_record(2.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN)]);
        assert_eq!(builder.active_count(), 1);
        assert_eq!(builder.stats().flows_created, 2);
    }

    #[test]
    fn test_simultaneous_open_earlier_timestamp_wins() {
        let mut builder = FlowBuilder::new(FlowConfig::default());
        // Responder's packet listed first but stamped later
        builder.ingest(vec![
            tcp_record(1.5, SERVER, 80, CLIENT, 44000, flag_bits::SYN),
            tcp_record(1.0, CLIENT, 44000, SERVER, 80, flag_bits::SYN),
        ]);
        assert_eq!(builder.active_count(), 1);

        let flows = builder.force_complete_all();
        assert_eq!(flows[0].src_port, 44000);
    }

    #[test]
    fn test_icmp_flow_uses_zero_ports() {
        let mut builder = FlowBuilder::new(FlowConfig::default());
        let mut ping = tcp_record(1.0, CLIENT, 0, SERVER, 0, 0);
        ping.protocol = IpProtocol::Icmp;
        let mut pong = tcp_record(1.1, SERVER, 0, CLIENT, 0, 0);
        pong.protocol = IpProtocol::Icmp;

        builder.ingest(vec![ping, pong]);
        assert_eq!(builder.active_count(), 1);

        let flows = builder.force_complete_all();
        assert_eq!(flows[0].fwd_packets.len(), 1);
        assert_eq!(flows[0].bwd_packets.len(), 1);
    }

    #[test]
    fn test_table_eviction() {
        let mut builder = FlowBuilder::new(FlowConfig {
            table_size: 2,
            ..FlowConfig::default()
        });
        for i in 0..3u16 {
            builder.ingest(vec![tcp_record(
                i as f64,
                CLIENT,
                40000 + i,
                SERVER,
                80,
                flag_bits::SYN,
            )]);
        }
        assert_eq!(builder.active_count(), 2);
        assert_eq!(builder.stats().flows_evicted, 1);
    }
}
