//! Configuration
//!
//! TOML file with serde defaults, then environment variables on top. The
//! environment keys are the operational contract; the file is a
//! convenience for development setups.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::decision::{
    DEFAULT_THRESHOLD_ATTACK, DEFAULT_WEIGHT_REPUTATION, DEFAULT_WEIGHT_SUPERVISED,
    DEFAULT_WEIGHT_UNSUPERVISED,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureSettings,

    #[serde(default)]
    pub inference: InferenceSettings,

    #[serde(default)]
    pub decision: DecisionSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub api: ApiSettings,
}

impl Config {
    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.as_ref().display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Apply recognised environment keys over the current values
    pub fn apply_env(&mut self) {
        env_string("CAPTURE_INTERFACE", &mut self.capture.interface);
        env_parse("CAPTURE_BUFFER_SIZE", &mut self.capture.buffer_size);
        env_parse("CAPTURE_FLOW_TIMEOUT", &mut self.capture.flow_timeout);
        env_parse("MAX_FLOW_DURATION", &mut self.capture.max_flow_duration);

        env_parse("ANOMALY_THRESHOLD_K", &mut self.inference.anomaly_threshold_k);
        env_parse(
            "MIN_CLASSIFICATION_CONFIDENCE",
            &mut self.inference.min_classification_confidence,
        );
        if let Ok(dir) = std::env::var("MODEL_DIR") {
            self.inference.model_dir = PathBuf::from(dir);
        }
        env_parse("INFERENCE_WORKERS", &mut self.inference.workers);
        env_parse("INFERENCE_QUEUE_SIZE", &mut self.inference.queue_size);

        env_parse("WEIGHT_SUPERVISED", &mut self.decision.weight_supervised);
        env_parse("WEIGHT_UNSUPERVISED", &mut self.decision.weight_unsupervised);
        env_parse("WEIGHT_REPUTATION", &mut self.decision.weight_reputation);
        env_parse("THRESHOLD_ATTACK", &mut self.decision.threshold_attack);

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.storage.redis_url = Some(url);
        }

        env_string("APP_HOST", &mut self.api.host);
        env_parse("APP_PORT", &mut self.api.port);
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        *target = value;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Interface name or `auto`
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Packet ring capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle seconds before a flow closes
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout: f64,

    /// Hard cap on flow duration
    #[serde(default = "default_max_flow_duration")]
    pub max_flow_duration: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            buffer_size: default_buffer_size(),
            flow_timeout: default_flow_timeout(),
            max_flow_duration: default_max_flow_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// Directory holding the six model artifacts
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Worker threads; 0 means one per core
    #[serde(default)]
    pub workers: usize,

    /// Bounded queue between the flow task and the workers
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// σ multiplier for the anomaly threshold
    #[serde(default = "default_threshold_k")]
    pub anomaly_threshold_k: f64,

    /// Confidence gate for the supervised is_attack call
    #[serde(default = "default_min_confidence")]
    pub min_classification_confidence: f32,
}

impl InferenceSettings {
    pub fn actual_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            workers: 0,
            queue_size: default_queue_size(),
            anomaly_threshold_k: default_threshold_k(),
            min_classification_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSettings {
    #[serde(default = "default_weight_supervised")]
    pub weight_supervised: f64,

    #[serde(default = "default_weight_unsupervised")]
    pub weight_unsupervised: f64,

    #[serde(default = "default_weight_reputation")]
    pub weight_reputation: f64,

    #[serde(default = "default_threshold_attack")]
    pub threshold_attack: f64,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            weight_supervised: default_weight_supervised(),
            weight_unsupervised: default_weight_unsupervised(),
            weight_reputation: default_weight_reputation(),
            threshold_attack: default_threshold_attack(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Redis connection URL; unset runs the in-process bus
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl ApiSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_interface() -> String {
    "auto".to_string()
}

fn default_buffer_size() -> usize {
    1000
}

fn default_flow_timeout() -> f64 {
    120.0
}

fn default_max_flow_duration() -> f64 {
    3600.0
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("./ai/artifacts")
}

fn default_queue_size() -> usize {
    4096
}

fn default_threshold_k() -> f64 {
    3.0
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_weight_supervised() -> f64 {
    DEFAULT_WEIGHT_SUPERVISED
}

fn default_weight_unsupervised() -> f64 {
    DEFAULT_WEIGHT_UNSUPERVISED
}

fn default_weight_reputation() -> f64 {
    DEFAULT_WEIGHT_REPUTATION
}

fn default_threshold_attack() -> f64 {
    DEFAULT_THRESHOLD_ATTACK
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/netsentry.db")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture.interface, "auto");
        assert_eq!(config.capture.buffer_size, 1000);
        assert!((config.capture.flow_timeout - 120.0).abs() < f64::EPSILON);
        assert!((config.inference.anomaly_threshold_k - 3.0).abs() < f64::EPSILON);
        assert!((config.decision.weight_supervised - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.api.port, 8000);
        assert!(config.storage.redis_url.is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.capture.buffer_size, config.capture.buffer_size);
        assert_eq!(parsed.inference.model_dir, config.inference.model_dir);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str("[capture]\ninterface = \"eth0\"\n").unwrap();
        assert_eq!(parsed.capture.interface, "eth0");
        assert_eq!(parsed.capture.buffer_size, 1000);
        assert_eq!(parsed.api.port, 8000);
    }

    #[test]
    fn test_actual_workers_auto() {
        let settings = InferenceSettings::default();
        assert!(settings.actual_workers() >= 1);

        let pinned = InferenceSettings {
            workers: 3,
            ..Default::default()
        };
        assert_eq!(pinned.actual_workers(), 3);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("NETSENTRY_TEST_BUFFER", "777");
        let mut value = 0usize;
        env_parse("NETSENTRY_TEST_BUFFER", &mut value);
        assert_eq!(value, 777);
        std::env::remove_var("NETSENTRY_TEST_BUFFER");
    }
}
