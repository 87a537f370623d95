//! Pre-trained artifact bundle
//!
//! Six fixed-name files make up a deployment. They load as an atomic unit:
//! if any is missing or unreadable the detection pipeline runs degraded
//! (capture continues, inference is skipped, no alerts are produced).
//! Models are trained offline; swapping them means restarting.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::features::NUM_FEATURES;

use super::nn::Mlp;
use super::preprocess::{FeatureSelector, Preprocessor, Scaler};
use super::supervised::{LabelEncoder, SupervisedPredictor};
use super::unsupervised::{ThresholdStats, UnsupervisedPredictor};

pub const SUPERVISED_MODEL_FILE: &str = "model_supervised.json";
pub const UNSUPERVISED_MODEL_FILE: &str = "model_unsupervised.json";
pub const SCALER_FILE: &str = "scaler.json";
pub const ENCODER_FILE: &str = "encoder.json";
pub const FEATURE_SELECTOR_FILE: &str = "feature_selector.json";
pub const THRESHOLD_STATS_FILE: &str = "threshold_stats.json";

pub const ARTIFACT_FILES: [&str; 6] = [
    SUPERVISED_MODEL_FILE,
    UNSUPERVISED_MODEL_FILE,
    SCALER_FILE,
    ENCODER_FILE,
    FEATURE_SELECTOR_FILE,
    THRESHOLD_STATS_FILE,
];

/// Artifact files absent from a directory
pub fn missing_artifacts(dir: &Path) -> Vec<String> {
    ARTIFACT_FILES
        .iter()
        .filter(|name| !dir.join(name).exists())
        .map(|name| name.to_string())
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file =
        File::open(path).with_context(|| format!("failed to open artifact {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse artifact {}", path.display()))
}

/// The loaded model set, shared read-only across inference workers
#[derive(Debug)]
pub struct ModelBundle {
    pub preprocessor: Preprocessor,
    pub supervised: SupervisedPredictor,
    pub unsupervised: UnsupervisedPredictor,
    pub model_dir: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

impl ModelBundle {
    /// Load and validate all six artifacts from a directory
    pub fn load(
        dir: &Path,
        threshold_k: f64,
        min_confidence: f32,
        z_max: f64,
    ) -> Result<Self> {
        let missing = missing_artifacts(dir);
        if !missing.is_empty() {
            bail!(
                "artifact directory {} is missing: {}",
                dir.display(),
                missing.join(", ")
            );
        }

        let selector: FeatureSelector = read_json(&dir.join(FEATURE_SELECTOR_FILE))?;
        let scaler: Scaler = read_json(&dir.join(SCALER_FILE))?;
        let encoder: LabelEncoder = read_json(&dir.join(ENCODER_FILE))?;
        let supervised_model: Mlp = read_json(&dir.join(SUPERVISED_MODEL_FILE))?;
        let unsupervised_model: Mlp = read_json(&dir.join(UNSUPERVISED_MODEL_FILE))?;

        // Unreadable threshold statistics degrade to defaults rather than
        // taking the whole bundle down; the predictor logs the fallback.
        let stats: Option<ThresholdStats> = match read_json(&dir.join(THRESHOLD_STATS_FILE)) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("threshold statistics unreadable: {:#}", e);
                None
            }
        };

        let preprocessor = Preprocessor::new(selector, scaler, NUM_FEATURES)?;

        if supervised_model.input_dim() != preprocessor.output_dim() {
            bail!(
                "classifier expects {} inputs but preprocessing yields {}",
                supervised_model.input_dim(),
                preprocessor.output_dim()
            );
        }
        if supervised_model.output_dim() != encoder.len() {
            bail!(
                "classifier has {} outputs but encoder defines {} classes",
                supervised_model.output_dim(),
                encoder.len()
            );
        }
        if unsupervised_model.input_dim() != preprocessor.output_dim()
            || unsupervised_model.output_dim() != preprocessor.output_dim()
        {
            bail!(
                "auto-encoder dims {}→{} do not match preprocessing width {}",
                unsupervised_model.input_dim(),
                unsupervised_model.output_dim(),
                preprocessor.output_dim()
            );
        }

        let bundle = Self {
            supervised: SupervisedPredictor::new(supervised_model, encoder, min_confidence),
            unsupervised: UnsupervisedPredictor::new(unsupervised_model, stats, threshold_k, z_max),
            preprocessor,
            model_dir: dir.to_path_buf(),
            loaded_at: Utc::now(),
        };

        bundle.warmup()?;
        info!(
            "model bundle loaded from {} ({} classes, {} features in, {} selected)",
            dir.display(),
            bundle.supervised.num_classes(),
            NUM_FEATURES,
            bundle.preprocessor.output_dim()
        );
        Ok(bundle)
    }

    /// One inference on a zero vector to amortise first-call costs
    fn warmup(&self) -> Result<()> {
        let zero = vec![0.0f32; self.preprocessor.input_dim()];
        let prepared = self.preprocessor.transform(&zero)?;
        let _ = self.supervised.predict(&prepared);
        let _ = self.unsupervised.predict(&prepared);
        Ok(())
    }
}

/// Reported at `/api/models/status`
#[derive(Debug, Clone, Serialize)]
pub struct ModelsStatus {
    /// False means the pipeline is running degraded
    pub ready: bool,
    pub model_dir: String,
    pub missing_artifacts: Vec<String>,
    pub num_classes: Option<usize>,
    pub features_in: Option<usize>,
    pub features_selected: Option<usize>,
    pub anomaly_threshold: Option<f64>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ModelsStatus {
    pub fn from_bundle(dir: &Path, bundle: Option<&ModelBundle>) -> Self {
        match bundle {
            Some(bundle) => Self {
                ready: true,
                model_dir: dir.display().to_string(),
                missing_artifacts: Vec::new(),
                num_classes: Some(bundle.supervised.num_classes()),
                features_in: Some(bundle.preprocessor.input_dim()),
                features_selected: Some(bundle.preprocessor.output_dim()),
                anomaly_threshold: Some(bundle.unsupervised.threshold()),
                loaded_at: Some(bundle.loaded_at),
            },
            None => Self {
                ready: false,
                model_dir: dir.display().to_string(),
                missing_artifacts: missing_artifacts(dir),
                num_classes: None,
                features_in: None,
                features_selected: None,
                anomaly_threshold: None,
                loaded_at: None,
            },
        }
    }
}
