//! Pipeline counters
//!
//! Each stage handles its own failures locally and increments a counter
//! rather than surfacing the error; this struct is the single place those
//! counters live.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters shared across every pipeline stage
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Packets accepted by the sniffer
    pub packets_captured: AtomicU64,
    /// Ring overflows (oldest record discarded)
    pub buffer_overflows: AtomicU64,
    /// Runtime capture read errors
    pub capture_errors: AtomicU64,
    /// Flows closed by the flow builder
    pub flows_completed: AtomicU64,
    /// Completed flows dropped because the inference queue was full
    pub flows_dropped: AtomicU64,
    /// Flows scored by both predictors
    pub flows_analyzed: AtomicU64,
    /// Flows skipped because the model bundle is unavailable
    pub inference_skipped: AtomicU64,
    /// Preprocessing / prediction failures
    pub inference_errors: AtomicU64,
    /// Rolled-back persistence transactions
    pub db_failures: AtomicU64,
    /// Alert rows written
    pub alerts_created: AtomicU64,
    /// Alerts delivered to the pub/sub channel
    pub alerts_published: AtomicU64,
    /// Pub/sub publish failures
    pub publish_failures: AtomicU64,
}

impl PipelineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            flows_completed: self.flows_completed.load(Ordering::Relaxed),
            flows_dropped: self.flows_dropped.load(Ordering::Relaxed),
            flows_analyzed: self.flows_analyzed.load(Ordering::Relaxed),
            inference_skipped: self.inference_skipped.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            db_failures: self.db_failures.load(Ordering::Relaxed),
            alerts_created: self.alerts_created.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, for status endpoints
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub packets_captured: u64,
    pub buffer_overflows: u64,
    pub capture_errors: u64,
    pub flows_completed: u64,
    pub flows_dropped: u64,
    pub flows_analyzed: u64,
    pub inference_skipped: u64,
    pub inference_errors: u64,
    pub db_failures: u64,
    pub alerts_created: u64,
    pub alerts_published: u64,
    pub publish_failures: u64,
}
