//! Multi-class attack classification
//!
//! Argmax over the classifier head, decoded through the label artifact.
//! Traffic is an attack only when the decoded label is not a benign class
//! and confidence clears the configured gate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::nn::Mlp;

/// Labels treated as non-attack traffic
const BENIGN_LABELS: [&str; 3] = ["BENIGN", "NORMAL", "LEGITIMATE"];

/// Label artifact: class names in model output order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelEncoder {
    pub fn decode(&self, index: usize) -> String {
        self.classes
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", index))
    }

    pub fn encode(&self, label: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == label)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Classifier output for one prepared vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisedOutput {
    pub predicted_label: String,
    pub confidence: f32,
    pub is_attack: bool,
    pub class_probabilities: BTreeMap<String, f32>,
}

/// Classifies prepared vectors into known attack types
///
/// Stateless across calls; safe to share read-only between workers.
#[derive(Debug)]
pub struct SupervisedPredictor {
    model: Mlp,
    encoder: LabelEncoder,
    min_confidence: f32,
}

impl SupervisedPredictor {
    pub fn new(model: Mlp, encoder: LabelEncoder, min_confidence: f32) -> Self {
        Self {
            model,
            encoder,
            min_confidence,
        }
    }

    pub fn encoder(&self) -> &LabelEncoder {
        &self.encoder
    }

    pub fn num_classes(&self) -> usize {
        self.encoder.len()
    }

    pub fn predict(&self, prepared: &[f32]) -> SupervisedOutput {
        let probs = self.model.forward(prepared);

        let (predicted_index, confidence) = probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, &p)| (i, p))
            .unwrap_or((0, 0.0));

        let predicted_label = self.encoder.decode(predicted_index);

        let class_probabilities: BTreeMap<String, f32> = probs
            .iter()
            .enumerate()
            .map(|(i, &p)| (self.encoder.decode(i), p))
            .collect();

        let is_benign = BENIGN_LABELS
            .iter()
            .any(|b| predicted_label.eq_ignore_ascii_case(b));
        let is_attack = !is_benign && confidence >= self.min_confidence;

        SupervisedOutput {
            predicted_label,
            confidence,
            is_attack,
            class_probabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::nn::{Activation, DenseLayer};

    /// Zero-weight softmax head: output depends only on the bias, which
    /// makes assertions exact.
    fn fixed_model(bias: Vec<f32>, inputs: usize) -> Mlp {
        let outputs = bias.len();
        Mlp {
            layers: vec![DenseLayer {
                weights: vec![vec![0.0; inputs]; outputs],
                bias,
                activation: Activation::Softmax,
            }],
        }
    }

    fn encoder() -> LabelEncoder {
        LabelEncoder {
            classes: vec!["BENIGN".into(), "DDoS".into(), "PortScan".into()],
        }
    }

    #[test]
    fn test_label_roundtrip() {
        let enc = encoder();
        for (i, label) in enc.classes.clone().iter().enumerate() {
            assert_eq!(enc.encode(&enc.decode(i)), Some(i));
            assert_eq!(enc.decode(enc.encode(label).unwrap()), *label);
        }
    }

    #[test]
    fn test_attack_prediction() {
        let predictor = SupervisedPredictor::new(fixed_model(vec![0.0, 8.0, 0.0], 4), encoder(), 0.5);
        let out = predictor.predict(&[0.0; 4]);
        assert_eq!(out.predicted_label, "DDoS");
        assert!(out.is_attack);
        assert!(out.confidence > 0.9);
        assert_eq!(out.class_probabilities.len(), 3);
    }

    #[test]
    fn test_benign_never_attack() {
        let predictor = SupervisedPredictor::new(fixed_model(vec![8.0, 0.0, 0.0], 4), encoder(), 0.5);
        let out = predictor.predict(&[0.0; 4]);
        assert_eq!(out.predicted_label, "BENIGN");
        assert!(!out.is_attack);
    }

    #[test]
    fn test_low_confidence_gates_attack() {
        // Near-uniform head: ~0.33 confidence, below the 0.5 gate
        let predictor =
            SupervisedPredictor::new(fixed_model(vec![0.0, 0.1, 0.0], 4), encoder(), 0.5);
        let out = predictor.predict(&[0.0; 4]);
        assert_eq!(out.predicted_label, "DDoS");
        assert!(!out.is_attack);
    }

    #[test]
    fn test_unknown_index_decodes_placeholder() {
        let enc = LabelEncoder { classes: vec![] };
        assert_eq!(enc.decode(7), "class_7");
    }
}
