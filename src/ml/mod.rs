//! Model loading and inference
//!
//! Pre-trained artifacts only: the preprocessing chain, the multi-class
//! classifier and the auto-encoder. No training happens in-process.

pub mod artifacts;
pub mod nn;
pub mod preprocess;
pub mod supervised;
pub mod unsupervised;

pub use artifacts::{missing_artifacts, ModelBundle, ModelsStatus, ARTIFACT_FILES};
pub use preprocess::{FeatureSelector, Preprocessor, Scaler, Validator};
pub use supervised::{LabelEncoder, SupervisedOutput, SupervisedPredictor};
pub use unsupervised::{ThresholdStats, UnsupervisedOutput, UnsupervisedPredictor};

/// Normalisation ceiling for the anomaly z-score
pub const Z_MAX: f64 = 10.0;
