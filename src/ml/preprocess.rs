//! Preprocessing chain
//!
//! `transform` applies, in this exact order:
//!   1. validation: NaN and infinities replaced with 0, values clipped
//!   2. feature selection: projection onto the artifact's index subset
//!   3. standardisation: `(x - mu)/sigma` with artifact-provided statistics
//!
//! Swapping selection and scaling produces silently-wrong predictions; the
//! ordering here mirrors the one the artifacts were fitted with.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Fallback clip bound when the artifacts carry no per-feature ranges
const GLOBAL_CLIP: f32 = 1e9;

/// Repairs invalid values before any model sees them
#[derive(Debug, Clone, Default)]
pub struct Validator {
    /// Optional per-feature plausible ranges, full input width
    pub clip_min: Option<Vec<f32>>,
    pub clip_max: Option<Vec<f32>>,
}

impl Validator {
    pub fn sanitize(&self, raw: &[f32]) -> Vec<f32> {
        raw.iter()
            .enumerate()
            .map(|(i, &v)| {
                let v = if v.is_finite() { v } else { 0.0 };
                let lo = self
                    .clip_min
                    .as_ref()
                    .and_then(|m| m.get(i).copied())
                    .unwrap_or(-GLOBAL_CLIP);
                let hi = self
                    .clip_max
                    .as_ref()
                    .and_then(|m| m.get(i).copied())
                    .unwrap_or(GLOBAL_CLIP);
                v.clamp(lo, hi)
            })
            .collect()
    }
}

/// Projects onto the artifact-defined feature subset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSelector {
    /// Indices into the raw vector, in model input order
    pub indices: Vec<usize>,
}

impl FeatureSelector {
    pub fn select(&self, values: &[f32]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(self.indices.len());
        for &idx in &self.indices {
            match values.get(idx) {
                Some(&v) => out.push(v),
                None => bail!(
                    "feature selector index {} out of bounds for vector of {}",
                    idx,
                    values.len()
                ),
            }
        }
        Ok(out)
    }

    pub fn output_dim(&self) -> usize {
        self.indices.len()
    }
}

/// Element-wise standardisation with fitted statistics
///
/// The optional clip ranges ride along in the scaler artifact and apply at
/// full input width, before selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    /// Per-feature mean, post-selection width
    pub mean: Vec<f32>,
    /// Per-feature standard deviation, post-selection width
    pub scale: Vec<f32>,
    #[serde(default)]
    pub clip_min: Option<Vec<f32>>,
    #[serde(default)]
    pub clip_max: Option<Vec<f32>>,
}

impl Scaler {
    pub fn standardize(&self, values: &[f32]) -> Result<Vec<f32>> {
        if values.len() != self.mean.len() || values.len() != self.scale.len() {
            bail!(
                "scaler width mismatch: got {} values, fitted on {}",
                values.len(),
                self.mean.len()
            );
        }
        Ok(values
            .iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(&v, (&mu, &sigma))| {
                if sigma.abs() > f32::EPSILON {
                    (v - mu) / sigma
                } else {
                    0.0
                }
            })
            .collect())
    }
}

/// The full validate → select → scale chain
#[derive(Debug, Clone)]
pub struct Preprocessor {
    validator: Validator,
    selector: FeatureSelector,
    scaler: Scaler,
    input_dim: usize,
}

impl Preprocessor {
    pub fn new(selector: FeatureSelector, scaler: Scaler, input_dim: usize) -> Result<Self> {
        if scaler.mean.len() != selector.output_dim() {
            bail!(
                "scaler fitted on {} features but selector keeps {}",
                scaler.mean.len(),
                selector.output_dim()
            );
        }
        let validator = Validator {
            clip_min: scaler.clip_min.clone(),
            clip_max: scaler.clip_max.clone(),
        };
        Ok(Self {
            validator,
            selector,
            scaler,
            input_dim,
        })
    }

    /// Expected raw vector width
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Model input width after selection
    pub fn output_dim(&self) -> usize {
        self.selector.output_dim()
    }

    pub fn transform(&self, raw: &[f32]) -> Result<Vec<f32>> {
        if raw.len() != self.input_dim {
            bail!(
                "feature vector has {} values, expected {}",
                raw.len(),
                self.input_dim
            );
        }
        let cleaned = self.validator.sanitize(raw);
        let selected = self.selector.select(&cleaned)?;
        self.scaler.standardize(&selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(
            FeatureSelector {
                indices: vec![0, 2],
            },
            Scaler {
                mean: vec![1.0, 10.0],
                scale: vec![2.0, 5.0],
                clip_min: None,
                clip_max: None,
            },
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_transform_chain() {
        let p = preprocessor();
        // raw [3, 99, 20] → select [3, 20] → scale [(3-1)/2, (20-10)/5]
        let out = p.transform(&[3.0, 99.0, 20.0]).unwrap();
        assert_eq!(out, vec![1.0, 2.0]);
    }

    #[test]
    fn test_nan_and_inf_repaired() {
        let p = preprocessor();
        let out = p.transform(&[f32::NAN, 0.0, f32::INFINITY]).unwrap();
        // NaN → 0 → (0-1)/2; Inf → 0 → (0-10)/5
        assert_eq!(out, vec![-0.5, -2.0]);
    }

    #[test]
    fn test_selection_must_precede_scaling() {
        // Scaling the full-width vector first then selecting would use the
        // wrong statistics per coordinate; prove the chain picks the
        // post-selection ones.
        let p = preprocessor();
        let raw = [5.0, 7.0, 15.0];
        let out = p.transform(&raw).unwrap();

        // Reversed order: scale raw[0..2] with the two-stat scaler then
        // select indices 0,2 is not even well-formed; nearest equivalent
        // (scale first two, pass third through) diverges from the chain.
        let wrong = [(raw[0] - 1.0) / 2.0, (raw[1] - 10.0) / 5.0];
        assert_ne!(out[1], wrong[1]);
        assert_eq!(out, vec![2.0, 1.0]);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let p = preprocessor();
        assert!(p.transform(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_clip_ranges_apply_before_selection() {
        let p = Preprocessor::new(
            FeatureSelector { indices: vec![1] },
            Scaler {
                mean: vec![0.0],
                scale: vec![1.0],
                clip_min: Some(vec![0.0, -10.0]),
                clip_max: Some(vec![1.0, 10.0]),
            },
            2,
        )
        .unwrap();
        let out = p.transform(&[500.0, 500.0]).unwrap();
        assert_eq!(out, vec![10.0]);
    }

    #[test]
    fn test_zero_sigma_yields_zero() {
        let p = Preprocessor::new(
            FeatureSelector { indices: vec![0] },
            Scaler {
                mean: vec![5.0],
                scale: vec![0.0],
                clip_min: None,
                clip_max: None,
            },
            1,
        )
        .unwrap();
        assert_eq!(p.transform(&[123.0]).unwrap(), vec![0.0]);
    }

    #[test]
    fn test_selector_out_of_bounds() {
        let selector = FeatureSelector { indices: vec![9] };
        assert!(selector.select(&[1.0, 2.0]).is_err());
    }
}
