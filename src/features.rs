//! Statistical feature extraction
//!
//! Turns a completed flow into the fixed-length, fixed-order vector the
//! pre-trained artifacts were fitted on (CIC-IDS2017 column layout). The
//! length and order are a contract of the system: reordering silently
//! breaks every prediction downstream.

use crate::core::{flag_bits, Flow, FlowPacket};

/// Number of values in every extracted vector
pub const NUM_FEATURES: usize = 78;

/// Column names in extraction order
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "Destination Port",
    "Flow Duration",
    "Total Fwd Packets",
    "Total Backward Packets",
    "Total Length of Fwd Packets",
    "Total Length of Bwd Packets",
    "Fwd Packet Length Max",
    "Fwd Packet Length Min",
    "Fwd Packet Length Mean",
    "Fwd Packet Length Std",
    "Bwd Packet Length Max",
    "Bwd Packet Length Min",
    "Bwd Packet Length Mean",
    "Bwd Packet Length Std",
    "Flow Bytes/s",
    "Flow Packets/s",
    "Flow IAT Mean",
    "Flow IAT Std",
    "Flow IAT Max",
    "Flow IAT Min",
    "Fwd IAT Total",
    "Fwd IAT Mean",
    "Fwd IAT Std",
    "Fwd IAT Max",
    "Fwd IAT Min",
    "Bwd IAT Total",
    "Bwd IAT Mean",
    "Bwd IAT Std",
    "Bwd IAT Max",
    "Bwd IAT Min",
    "Fwd PSH Flags",
    "Bwd PSH Flags",
    "Fwd URG Flags",
    "Bwd URG Flags",
    "Fwd Header Length",
    "Bwd Header Length",
    "Fwd Packets/s",
    "Bwd Packets/s",
    "Min Packet Length",
    "Max Packet Length",
    "Packet Length Mean",
    "Packet Length Std",
    "Packet Length Variance",
    "FIN Flag Count",
    "SYN Flag Count",
    "RST Flag Count",
    "PSH Flag Count",
    "ACK Flag Count",
    "URG Flag Count",
    "CWE Flag Count",
    "ECE Flag Count",
    "Down/Up Ratio",
    "Average Packet Size",
    "Avg Fwd Segment Size",
    "Avg Bwd Segment Size",
    "Fwd Header Length.1",
    "Fwd Avg Bytes/Bulk",
    "Fwd Avg Packets/Bulk",
    "Fwd Avg Bulk Rate",
    "Bwd Avg Bytes/Bulk",
    "Bwd Avg Packets/Bulk",
    "Bwd Avg Bulk Rate",
    "Subflow Fwd Packets",
    "Subflow Fwd Bytes",
    "Subflow Bwd Packets",
    "Subflow Bwd Bytes",
    "Init_Win_bytes_forward",
    "Init_Win_bytes_backward",
    "act_data_pkt_fwd",
    "min_seg_size_forward",
    "Active Mean",
    "Active Std",
    "Active Max",
    "Active Min",
    "Idle Mean",
    "Idle Std",
    "Idle Max",
    "Idle Min",
];

// Per-packet TCP headers approximated at a constant 40 bytes, matching the
// training-set extraction.
const HEADER_LEN: f64 = 40.0;

#[derive(Debug, Clone, Copy, Default)]
struct SummaryStats {
    mean: f64,
    std: f64,
    max: f64,
    min: f64,
    total: f64,
}

/// Mean/std/max/min/total over a value list; empty input yields zeros,
/// never NaN.
fn safe_stats(values: &[f64]) -> SummaryStats {
    if values.is_empty() {
        return SummaryStats::default();
    }
    let total: f64 = values.iter().sum();
    let mean = total / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    let mut max = f64::MIN;
    let mut min = f64::MAX;
    for &v in values {
        if v > max {
            max = v;
        }
        if v < min {
            min = v;
        }
    }
    SummaryStats {
        mean,
        std: variance.sqrt(),
        max,
        min,
        total,
    }
}

/// Inter-arrival times over a packet list, in seconds
fn iat_stats(packets: &[&FlowPacket]) -> SummaryStats {
    if packets.len() < 2 {
        return SummaryStats::default();
    }
    let mut timestamps: Vec<f64> = packets.iter().map(|p| p.timestamp).collect();
    timestamps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let iats: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    safe_stats(&iats)
}

fn count_flags(packets: &[&FlowPacket], bit: u8) -> f64 {
    packets.iter().filter(|p| p.tcp_flags & bit != 0).count() as f64
}

/// Extract the fixed-order feature vector from a completed flow
///
/// Pure function of the flow; safe to call from any worker.
pub fn extract(flow: &Flow) -> Vec<f32> {
    let fwd: Vec<&FlowPacket> = flow.fwd_packets.iter().collect();
    let bwd: Vec<&FlowPacket> = flow.bwd_packets.iter().collect();
    let all: Vec<&FlowPacket> = fwd.iter().chain(bwd.iter()).copied().collect();
    let duration = flow.duration();

    let fwd_sizes: Vec<f64> = fwd.iter().map(|p| p.size as f64).collect();
    let bwd_sizes: Vec<f64> = bwd.iter().map(|p| p.size as f64).collect();
    let all_sizes: Vec<f64> = fwd_sizes.iter().chain(bwd_sizes.iter()).copied().collect();

    let fwd_stats = safe_stats(&fwd_sizes);
    let bwd_stats = safe_stats(&bwd_sizes);
    let all_stats = safe_stats(&all_sizes);

    let flow_iat = iat_stats(&all);
    let fwd_iat = iat_stats(&fwd);
    let bwd_iat = iat_stats(&bwd);

    let per_second = |count: f64| if duration > 0.0 { count / duration } else { 0.0 };
    let flow_bytes_per_s = per_second(all_stats.total);
    let flow_packets_per_s = per_second(all.len() as f64);
    let fwd_packets_per_s = per_second(fwd.len() as f64);
    let bwd_packets_per_s = per_second(bwd.len() as f64);

    let fwd_header_len = fwd.len() as f64 * HEADER_LEN;
    let bwd_header_len = bwd.len() as f64 * HEADER_LEN;

    let down_up_ratio = if !fwd.is_empty() {
        bwd.len() as f64 / fwd.len() as f64
    } else {
        0.0
    };

    let init_win_fwd = fwd.first().map(|p| p.tcp_window as f64).unwrap_or(0.0);
    let init_win_bwd = bwd.first().map(|p| p.tcp_window as f64).unwrap_or(0.0);

    let act_data_fwd = fwd.iter().filter(|p| p.payload_size > 0).count() as f64;
    let min_seg_fwd = fwd_stats.min;

    let features: [f64; NUM_FEATURES] = [
        flow.dst_port as f64,
        duration * 1e6, // microseconds
        fwd.len() as f64,
        bwd.len() as f64,
        fwd_stats.total,
        bwd_stats.total,
        fwd_stats.max,
        fwd_stats.min,
        fwd_stats.mean,
        fwd_stats.std,
        bwd_stats.max,
        bwd_stats.min,
        bwd_stats.mean,
        bwd_stats.std,
        flow_bytes_per_s,
        flow_packets_per_s,
        flow_iat.mean,
        flow_iat.std,
        flow_iat.max,
        flow_iat.min,
        fwd_iat.total,
        fwd_iat.mean,
        fwd_iat.std,
        fwd_iat.max,
        fwd_iat.min,
        bwd_iat.total,
        bwd_iat.mean,
        bwd_iat.std,
        bwd_iat.max,
        bwd_iat.min,
        count_flags(&fwd, flag_bits::PSH),
        count_flags(&bwd, flag_bits::PSH),
        count_flags(&fwd, flag_bits::URG),
        count_flags(&bwd, flag_bits::URG),
        fwd_header_len,
        bwd_header_len,
        fwd_packets_per_s,
        bwd_packets_per_s,
        all_stats.min,
        all_stats.max,
        all_stats.mean,
        all_stats.std,
        all_stats.std * all_stats.std,
        count_flags(&all, flag_bits::FIN),
        count_flags(&all, flag_bits::SYN),
        count_flags(&all, flag_bits::RST),
        count_flags(&all, flag_bits::PSH),
        count_flags(&all, flag_bits::ACK),
        count_flags(&all, flag_bits::URG),
        count_flags(&all, flag_bits::CWR),
        count_flags(&all, flag_bits::ECE),
        down_up_ratio,
        all_stats.mean,
        fwd_stats.mean,
        bwd_stats.mean,
        fwd_header_len,
        0.0, // bulk metrics not computed at capture time
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        fwd.len() as f64,
        fwd_stats.total,
        bwd.len() as f64,
        bwd_stats.total,
        init_win_fwd,
        init_win_bwd,
        act_data_fwd,
        min_seg_fwd,
        0.0, // active/idle windows not tracked
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
    ];

    features.iter().map(|&v| v as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpProtocol, PacketRecord};
    use std::net::{IpAddr, Ipv4Addr};

    fn record(ts: f64, src: [u8; 4], sport: u16, size: u32, flags: u8) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            src_ip: IpAddr::V4(Ipv4Addr::from(src)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: sport,
            dst_port: 443,
            protocol: IpProtocol::Tcp,
            size,
            tcp_flags: flags,
            tcp_window: 2048,
            payload_size: if size > 40 { size - 40 } else { 0 },
        }
    }

    fn reply(ts: f64, size: u32, flags: u8) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            src_port: 443,
            dst_port: 40000,
            protocol: IpProtocol::Tcp,
            size,
            tcp_flags: flags,
            tcp_window: 4096,
            payload_size: 0,
        }
    }

    fn client(ts: f64, size: u32, flags: u8) -> PacketRecord {
        record(ts, [192, 168, 1, 5], 40000, size, flags)
    }

    #[test]
    fn test_vector_length_is_constant() {
        let flow = Flow::new(&client(1.0, 60, flag_bits::SYN));
        assert_eq!(extract(&flow).len(), NUM_FEATURES);
        assert_eq!(FEATURE_NAMES.len(), NUM_FEATURES);
    }

    #[test]
    fn test_single_packet_flow_has_no_nan() {
        let flow = Flow::new(&client(1.0, 60, flag_bits::SYN));
        let vector = extract(&flow);
        assert!(vector.iter().all(|v| v.is_finite()));
        // Backward stats are all zero
        assert_eq!(vector[10], 0.0); // Bwd Packet Length Max
        assert_eq!(vector[3], 0.0); // Total Backward Packets
    }

    #[test]
    fn test_known_flow_values() {
        let mut flow = Flow::new(&client(0.0, 100, flag_bits::SYN));
        flow.push(&reply(1.0, 200, flag_bits::SYN | flag_bits::ACK));
        flow.push(&client(2.0, 100, flag_bits::ACK));

        let vector = extract(&flow);
        assert_eq!(vector[0], 443.0); // Destination Port
        assert_eq!(vector[1], 2_000_000.0); // duration in microseconds
        assert_eq!(vector[2], 2.0); // fwd packets
        assert_eq!(vector[3], 1.0); // bwd packets
        assert_eq!(vector[4], 200.0); // fwd bytes
        assert_eq!(vector[5], 200.0); // bwd bytes
        assert_eq!(vector[14], 200.0); // bytes/s over 2 s
        assert_eq!(vector[15], 1.5); // packets/s
        assert_eq!(vector[44], 2.0); // SYN count
        assert_eq!(vector[51], 0.5); // down/up ratio
        assert_eq!(vector[66], 2048.0); // init win fwd
        assert_eq!(vector[67], 4096.0); // init win bwd
    }

    #[test]
    fn test_zero_duration_rates_are_zero() {
        let mut flow = Flow::new(&client(5.0, 100, 0));
        flow.push(&client(5.0, 100, 0));
        let vector = extract(&flow);
        assert_eq!(vector[14], 0.0); // Flow Bytes/s
        assert_eq!(vector[15], 0.0); // Flow Packets/s
        assert!(vector.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_extract_is_deterministic() {
        let mut flow = Flow::new(&client(0.0, 100, flag_bits::SYN));
        flow.push(&reply(0.5, 150, flag_bits::SYN | flag_bits::ACK));
        assert_eq!(extract(&flow), extract(&flow));
    }
}
