//! Flow reconstruction
//!
//! Groups packet records into bidirectional flows keyed by the canonical
//! 5-tuple and emits them on completion.

mod builder;

use serde::{Deserialize, Serialize};

pub use builder::FlowBuilder;

/// Flow builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Seconds of inactivity before a flow is closed
    pub idle_timeout: f64,
    /// Hard cap on flow duration, bounds memory for long-lived flows
    pub max_duration: f64,
    /// Maximum concurrently tracked flows; oldest evicted beyond this
    pub table_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 120.0,
            max_duration: 3600.0,
            table_size: 100_000,
        }
    }
}

/// Running totals for the flow builder
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BuilderStats {
    pub packets_processed: u64,
    pub flows_created: u64,
    pub flows_completed: u64,
    pub flows_evicted: u64,
}
