//! Auto-encoder anomaly detection
//!
//! The encoder was trained on benign traffic only: it reconstructs normal
//! flows well and badly anything it has never seen. The anomaly threshold
//! is `μ + kσ` over the training-set reconstruction errors.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::nn::Mlp;

/// Threshold statistics artifact captured at training time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdStats {
    pub mean: f64,
    pub std: f64,
    /// Pre-computed threshold; derived from mean/std when absent
    #[serde(default)]
    pub threshold: Option<f64>,
}

// Fallbacks when the stats artifact is unreadable
const DEFAULT_ERROR_MEAN: f64 = 0.01;
const DEFAULT_ERROR_STD: f64 = 0.005;

/// Anomaly output for one prepared vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsupervisedOutput {
    pub reconstruction_error: f64,
    /// `clamp(z / z_max, 0, 1)`
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub threshold_used: f64,
}

/// Scores prepared vectors by reconstruction error
///
/// Stateless across calls; safe to share read-only between workers.
#[derive(Debug)]
pub struct UnsupervisedPredictor {
    model: Mlp,
    baseline_mean: f64,
    baseline_std: f64,
    threshold: f64,
    z_max: f64,
}

impl UnsupervisedPredictor {
    pub fn new(model: Mlp, stats: Option<ThresholdStats>, threshold_k: f64, z_max: f64) -> Self {
        let (baseline_mean, baseline_std, threshold) = match stats {
            Some(stats) => {
                let threshold = stats
                    .threshold
                    .unwrap_or(stats.mean + threshold_k * stats.std);
                (stats.mean, stats.std, threshold)
            }
            None => {
                warn!(
                    "threshold statistics missing, using defaults (mean={}, std={})",
                    DEFAULT_ERROR_MEAN, DEFAULT_ERROR_STD
                );
                (
                    DEFAULT_ERROR_MEAN,
                    DEFAULT_ERROR_STD,
                    DEFAULT_ERROR_MEAN + threshold_k * DEFAULT_ERROR_STD,
                )
            }
        };

        Self {
            model,
            baseline_mean,
            baseline_std,
            threshold,
            z_max,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn predict(&self, prepared: &[f32]) -> UnsupervisedOutput {
        let reconstructed = self.model.forward(prepared);
        let reconstruction_error = mean_squared_error(prepared, &reconstructed);

        let z = if self.baseline_std > 0.0 {
            (reconstruction_error - self.baseline_mean) / self.baseline_std
        } else {
            0.0
        };
        let anomaly_score = (z / self.z_max).clamp(0.0, 1.0);

        UnsupervisedOutput {
            reconstruction_error,
            anomaly_score,
            is_anomaly: reconstruction_error > self.threshold,
            threshold_used: self.threshold,
        }
    }
}

/// MSE between an input and its reconstruction
fn mean_squared_error(input: &[f32], reconstructed: &[f32]) -> f64 {
    if input.is_empty() {
        return 0.0;
    }
    let n = input.len().min(reconstructed.len()).max(1);
    input
        .iter()
        .zip(reconstructed.iter())
        .map(|(&a, &b)| {
            let d = a as f64 - b as f64;
            d * d
        })
        .sum::<f64>()
        / n as f64
}
