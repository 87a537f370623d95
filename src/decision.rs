//! Hybrid decision engine
//!
//! Fuses the classifier, the auto-encoder and an IP-reputation signal into
//! one risk score, then maps it through the decision matrix to a verdict,
//! a severity and a SOC priority.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::ml::{SupervisedOutput, UnsupervisedOutput};

/// Default fusion weights
pub const DEFAULT_WEIGHT_SUPERVISED: f64 = 0.50;
pub const DEFAULT_WEIGHT_UNSUPERVISED: f64 = 0.30;
pub const DEFAULT_WEIGHT_REPUTATION: f64 = 0.20;

/// Risk cut above which two benign-looking signals still raise suspicion
pub const DEFAULT_THRESHOLD_ATTACK: f64 = 0.70;

/// Confidence needed for a lone supervised hit to confirm an attack
const CONFIRM_CONFIDENCE: f32 = 0.80;

/// Final classification of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    ConfirmedAttack,
    Suspicious,
    UnknownAnomaly,
    Normal,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::ConfirmedAttack => "confirmed_attack",
            Verdict::Suspicious => "suspicious",
            Verdict::UnknownAnomaly => "unknown_anomaly",
            Verdict::Normal => "normal",
        }
    }
}

/// Alert severity derived from the final risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Pure function of the risk score
    pub fn from_risk(risk: f64) -> Self {
        if risk >= 0.85 {
            Severity::Critical
        } else if risk >= 0.65 {
            Severity::High
        } else if risk >= 0.40 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

/// The fused decision for one flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub severity: Severity,
    /// 1 = most urgent, 5 = routine
    pub priority: u8,
    pub final_risk: f64,
    /// Attack label when the classifier called one, else None
    pub attack_type: Option<String>,
    pub supervised_risk: f64,
    pub anomaly_score: f64,
    pub ip_reputation: f64,
}

impl Decision {
    /// Structured breakdown persisted into alert metadata
    pub fn details(&self, weights: (f64, f64, f64)) -> serde_json::Value {
        json!({
            "supervised_risk": self.supervised_risk,
            "anomaly_score": self.anomaly_score,
            "ip_reputation": self.ip_reputation,
            "weights": {
                "supervised": weights.0,
                "unsupervised": weights.1,
                "reputation": weights.2,
            },
        })
    }
}

/// Weighted fusion of both predictors and IP reputation
pub struct DecisionEngine {
    w_sup: f64,
    w_unsup: f64,
    w_rep: f64,
    threshold_attack: f64,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(
            DEFAULT_WEIGHT_SUPERVISED,
            DEFAULT_WEIGHT_UNSUPERVISED,
            DEFAULT_WEIGHT_REPUTATION,
            DEFAULT_THRESHOLD_ATTACK,
        )
    }
}

impl DecisionEngine {
    /// Weights are renormalised so they always sum to 1
    pub fn new(w_sup: f64, w_unsup: f64, w_rep: f64, threshold_attack: f64) -> Self {
        let total = w_sup + w_unsup + w_rep;
        let (w_sup, w_unsup, w_rep) = if total > 0.0 {
            (w_sup / total, w_unsup / total, w_rep / total)
        } else {
            warn!("fusion weights sum to zero, using defaults");
            (
                DEFAULT_WEIGHT_SUPERVISED,
                DEFAULT_WEIGHT_UNSUPERVISED,
                DEFAULT_WEIGHT_REPUTATION,
            )
        };
        Self {
            w_sup,
            w_unsup,
            w_rep,
            threshold_attack,
        }
    }

    pub fn weights(&self) -> (f64, f64, f64) {
        (self.w_sup, self.w_unsup, self.w_rep)
    }

    /// Fuse both predictor outputs with the reputation signal
    pub fn decide(
        &self,
        supervised: &SupervisedOutput,
        unsupervised: &UnsupervisedOutput,
        ip_reputation: f64,
    ) -> Decision {
        let confidence = supervised.confidence as f64;

        // High-confidence BENIGN means low risk, not high
        let supervised_risk = if supervised.is_attack {
            confidence
        } else {
            1.0 - confidence
        };

        let final_risk = (self.w_sup * supervised_risk
            + self.w_unsup * unsupervised.anomaly_score
            + self.w_rep * ip_reputation)
            .clamp(0.0, 1.0);

        let verdict = self.verdict(
            supervised.is_attack,
            unsupervised.is_anomaly,
            final_risk,
            supervised.confidence,
        );
        let severity = Severity::from_risk(final_risk);
        let priority = priority(severity, verdict);

        Decision {
            verdict,
            severity,
            priority,
            final_risk,
            attack_type: supervised
                .is_attack
                .then(|| supervised.predicted_label.clone()),
            supervised_risk,
            anomaly_score: unsupervised.anomaly_score,
            ip_reputation,
        }
    }

    fn verdict(
        &self,
        is_attack: bool,
        is_anomaly: bool,
        final_risk: f64,
        confidence: f32,
    ) -> Verdict {
        match (is_attack, is_anomaly) {
            (true, true) => Verdict::ConfirmedAttack,
            (true, false) => {
                if confidence >= CONFIRM_CONFIDENCE {
                    Verdict::ConfirmedAttack
                } else {
                    Verdict::Suspicious
                }
            }
            (false, true) => Verdict::UnknownAnomaly,
            (false, false) => {
                // Reputation alone can still push the score over the cut
                if final_risk >= self.threshold_attack {
                    Verdict::Suspicious
                } else {
                    Verdict::Normal
                }
            }
        }
    }
}

/// SOC priority from the (severity, verdict) pair
fn priority(severity: Severity, verdict: Verdict) -> u8 {
    use Severity::*;
    use Verdict::*;
    match (severity, verdict) {
        (Critical, ConfirmedAttack) | (Critical, UnknownAnomaly) => 1,
        (Critical, Suspicious) => 2,
        (High, ConfirmedAttack) | (High, UnknownAnomaly) => 2,
        (High, Suspicious) => 3,
        (Medium, ConfirmedAttack) | (Medium, UnknownAnomaly) => 3,
        (Medium, Suspicious) => 4,
        _ => 5,
    }
}
