//! Errors returned across the caller-facing surfaces
//!
//! Only `start()`, `stop()`, interface changes and `analyze()` return errors
//! to callers; everything else counts failures in [`crate::metrics`] and
//! keeps the capture path live.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture is already running")]
    AlreadyRunning,

    #[error("capture setup failed: {0}")]
    CaptureSetup(String),

    #[error("interface cannot be changed while capture is running")]
    CaptureActive,

    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    #[error("detection models unavailable: {0}")]
    Degraded(String),

    #[error("invalid feature vector: expected {expected} values, got {got}")]
    BadVector { expected: usize, got: usize },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
