//! Bounded packet ring
//!
//! The only synchronisation point between the capture thread and the flow
//! task. Fixed capacity; on overflow the oldest record is discarded and
//! counted, never signalled as an error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::PacketRecord;

pub struct PacketRing {
    inner: Mutex<VecDeque<PacketRecord>>,
    capacity: usize,
    overflows: AtomicU64,
}

impl PacketRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            overflows: AtomicU64::new(0),
        }
    }

    /// Append a record, discarding the oldest when full
    pub fn push(&self, rec: PacketRecord) {
        let mut buf = self.inner.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        buf.push_back(rec);
    }

    /// Remove up to `max` records in arrival order
    pub fn drain(&self, max: usize) -> Vec<PacketRecord> {
        let mut buf = self.inner.lock();
        let take = buf.len().min(max);
        buf.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of the ring currently occupied, 0.0 - 1.0
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IpProtocol;
    use std::net::{IpAddr, Ipv4Addr};

    fn record(seq: u16) -> PacketRecord {
        PacketRecord {
            timestamp: seq as f64,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: seq,
            dst_port: 80,
            protocol: IpProtocol::Tcp,
            size: 60,
            tcp_flags: 0,
            tcp_window: 0,
            payload_size: 0,
        }
    }

    #[test]
    fn test_push_and_drain_order() {
        let ring = PacketRing::new(10);
        for i in 0..5 {
            ring.push(record(i));
        }
        let drained = ring.drain(100);
        assert_eq!(drained.len(), 5);
        assert_eq!(drained[0].src_port, 0);
        assert_eq!(drained[4].src_port, 4);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let ring = PacketRing::new(3);
        for i in 0..4 {
            ring.push(record(i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.overflow_count(), 1);

        // Oldest (0) was discarded
        let drained = ring.drain(10);
        assert_eq!(drained[0].src_port, 1);
        assert_eq!(drained[2].src_port, 3);
    }

    #[test]
    fn test_partial_drain() {
        let ring = PacketRing::new(10);
        for i in 0..6 {
            ring.push(record(i));
        }
        let first = ring.drain(4);
        assert_eq!(first.len(), 4);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.drain(4).len(), 2);
    }

    #[test]
    fn test_fill_ratio() {
        let ring = PacketRing::new(4);
        ring.push(record(0));
        assert!((ring.fill_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
