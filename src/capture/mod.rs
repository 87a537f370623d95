//! Packet acquisition
//!
//! The [`Sniffer`] owns a dedicated capture thread that polls the selected
//! backend and appends normalised records to the bounded ring. Runtime read
//! errors are logged, counted and retried after a short back-off; only
//! setup failures surface to the caller of `start()`.

pub mod backend;
pub mod ring;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;

pub use backend::{list_interfaces, open_backend, CaptureMode};
pub use ring::PacketRing;

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Snapshot of the sniffer for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub running: bool,
    pub interface: String,
    pub mode: Option<CaptureMode>,
    pub packets_captured: u64,
    pub buffer_fill: f64,
    pub buffer_overflows: u64,
    pub capture_errors: u64,
    /// Flows currently being reconstructed; overlaid by the pipeline,
    /// which owns the flow table
    pub active_flows: usize,
    /// Flows closed since startup; overlaid by the pipeline
    pub completed_flows: u64,
    pub last_error: Option<String>,
    pub available_interfaces: Vec<String>,
}

struct SnifferState {
    mode: Option<CaptureMode>,
    last_error: Option<String>,
}

/// Passive packet sniffer over one interface
pub struct Sniffer {
    interface: RwLock<String>,
    ring: Arc<PacketRing>,
    running: Arc<AtomicBool>,
    state: Arc<RwLock<SnifferState>>,
    metrics: Arc<PipelineMetrics>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Sniffer {
    pub fn new(interface: String, buffer_size: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            interface: RwLock::new(interface),
            ring: Arc::new(PacketRing::new(buffer_size)),
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(RwLock::new(SnifferState {
                mode: None,
                last_error: None,
            })),
            metrics,
            handle: Mutex::new(None),
        }
    }

    /// The ring the flow task drains
    pub fn ring(&self) -> Arc<PacketRing> {
        self.ring.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn interface(&self) -> String {
        self.interface.read().clone()
    }

    /// Change the capture interface; rejected while running
    pub fn set_interface(&self, name: &str) -> Result<(), PipelineError> {
        if self.is_running() {
            return Err(PipelineError::CaptureActive);
        }
        if name != "auto" {
            let known = list_interfaces().map_err(PipelineError::Internal)?;
            if !known.iter().any(|n| n == name) {
                return Err(PipelineError::UnknownInterface(name.to_string()));
            }
        }
        *self.interface.write() = name.to_string();
        Ok(())
    }

    /// Start the capture thread
    ///
    /// Backend setup happens on the calling thread so permission problems
    /// surface here instead of dying silently inside the loop.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }

        let interface = self.interface();
        let mut capture = match open_backend(&interface) {
            Ok(capture) => capture,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.state.write().last_error = Some(format!("{:#}", e));
                return Err(PipelineError::CaptureSetup(format!("{:#}", e)));
            }
        };

        let mode = capture.mode();
        {
            let mut state = self.state.write();
            state.mode = Some(mode);
            state.last_error = None;
        }
        info!("capture started on {} ({})", interface, mode);

        let ring = self.ring.clone();
        let running = self.running.clone();
        let state = self.state.clone();
        let metrics = self.metrics.clone();

        let handle = std::thread::Builder::new()
            .name("netsentry-capture".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match capture.next_record() {
                        Ok(Some(rec)) => {
                            PipelineMetrics::incr(&metrics.packets_captured);
                            let before = ring.overflow_count();
                            ring.push(rec);
                            let dropped = ring.overflow_count() - before;
                            if dropped > 0 {
                                metrics
                                    .buffer_overflows
                                    .fetch_add(dropped, Ordering::Relaxed);
                            }
                        }
                        Ok(None) => {} // read timeout or non-IP frame
                        Err(e) => {
                            PipelineMetrics::incr(&metrics.capture_errors);
                            error!("capture read error: {:#}", e);
                            state.write().last_error = Some(format!("{:#}", e));
                            std::thread::sleep(ERROR_BACKOFF);
                        }
                    }
                }
            })
            .map_err(|e| PipelineError::Internal(e.into()))?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the capture thread; idempotent
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("capture thread terminated abnormally");
            }
        }
        info!(
            "capture stopped ({} packets total)",
            self.metrics
                .packets_captured
                .load(Ordering::Relaxed)
        );
    }

    pub fn status(&self) -> CaptureStatus {
        let state = self.state.read();
        CaptureStatus {
            running: self.is_running(),
            interface: self.interface(),
            mode: state.mode,
            packets_captured: self.metrics.packets_captured.load(Ordering::Relaxed),
            buffer_fill: self.ring.fill_ratio(),
            buffer_overflows: self.ring.overflow_count(),
            capture_errors: self.metrics.capture_errors.load(Ordering::Relaxed),
            active_flows: 0,
            completed_flows: 0,
            last_error: state.last_error.clone(),
            available_interfaces: list_interfaces().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_before_start_is_noop() {
        let sniffer = Sniffer::new("auto".into(), 16, Arc::new(PipelineMetrics::default()));
        sniffer.stop();
        sniffer.stop();
        assert!(!sniffer.is_running());
    }

    #[test]
    fn test_set_interface_while_stopped() {
        let sniffer = Sniffer::new("auto".into(), 16, Arc::new(PipelineMetrics::default()));
        assert!(sniffer.set_interface("auto").is_ok());
        assert_eq!(sniffer.interface(), "auto");
    }

    #[test]
    fn test_status_shape_when_stopped() {
        let sniffer = Sniffer::new("auto".into(), 16, Arc::new(PipelineMetrics::default()));
        let status = sniffer.status();
        assert!(!status.running);
        assert!(status.mode.is_none());
        assert_eq!(status.packets_captured, 0);
        // Flow counts belong to the pipeline; the sniffer reports none
        assert_eq!(status.active_flows, 0);
        assert_eq!(status.completed_flows, 0);
    }
}
