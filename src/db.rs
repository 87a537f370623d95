//! Flow datastore
//!
//! Embedded SQLite behind a shared handle. Each analysed flow is persisted
//! in one transaction: the flow row, its prediction, its anomaly score and,
//! only when the verdict is not `normal`, an alert row. Any failure rolls
//! the whole set back; the flow is dropped and counted, never retried.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::Flow;
use crate::decision::{Decision, Severity, Verdict};
use crate::ml::{SupervisedOutput, UnsupervisedOutput};

const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persisted flow row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub duration: f64,
    pub total_fwd_packets: u64,
    pub total_bwd_packets: u64,
    pub flow_bytes_per_s: f64,
    pub flow_packets_per_s: f64,
    pub close_reason: Option<String>,
    /// Full feature vector for forensic replay; optional by design
    pub raw_features: Option<Vec<f32>>,
}

impl FlowRecord {
    pub fn from_flow(flow: &Flow, raw_features: Option<Vec<f32>>) -> Self {
        let duration = flow.duration();
        let rate = |count: f64| if duration > 0.0 { count / duration } else { 0.0 };
        Self {
            id: flow.id,
            timestamp: epoch_to_datetime(flow.start_time),
            src_ip: flow.src_ip.to_string(),
            dst_ip: flow.dst_ip.to_string(),
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            protocol: flow.protocol.into(),
            duration,
            total_fwd_packets: flow.fwd_packets.len() as u64,
            total_bwd_packets: flow.bwd_packets.len() as u64,
            flow_bytes_per_s: rate(flow.total_bytes() as f64),
            flow_packets_per_s: rate(flow.total_packets() as f64),
            close_reason: flow.close_reason.map(|r| r.as_str().to_string()),
            raw_features,
        }
    }
}

/// Persisted classifier output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub predicted_label: String,
    pub confidence: f32,
    pub class_probabilities: Value,
}

impl PredictionRecord {
    pub fn new(flow_id: Uuid, output: &SupervisedOutput) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            timestamp: Utc::now(),
            predicted_label: output.predicted_label.clone(),
            confidence: output.confidence,
            class_probabilities: serde_json::to_value(&output.class_probabilities)
                .unwrap_or(Value::Null),
        }
    }
}

/// Persisted auto-encoder output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub reconstruction_error: f64,
    pub anomaly_score: f64,
    pub threshold_used: f64,
    pub is_anomaly: bool,
}

impl AnomalyRecord {
    pub fn new(flow_id: Uuid, output: &UnsupervisedOutput) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            timestamp: Utc::now(),
            reconstruction_error: output.reconstruction_error,
            anomaly_score: output.anomaly_score,
            threshold_used: output.threshold_used,
            is_anomaly: output.is_anomaly,
        }
    }
}

/// Persisted and published alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub attack_type: Option<String>,
    pub threat_score: f64,
    pub decision: Verdict,
    /// open → acknowledged → resolved; always starts open
    pub status: String,
    pub priority: u8,
    pub metadata: Value,
}

impl AlertRecord {
    /// Build an alert iff the verdict is not `normal`
    pub fn from_decision(flow: &Flow, decision: &Decision, details: Value) -> Option<Self> {
        if decision.verdict == Verdict::Normal {
            return None;
        }
        let metadata = serde_json::json!({
            "src_ip": flow.src_ip.to_string(),
            "dst_ip": flow.dst_ip.to_string(),
            "src_port": flow.src_port,
            "dst_port": flow.dst_port,
            "protocol": u8::from(flow.protocol),
            "details": details,
        });
        Some(Self {
            id: Uuid::new_v4(),
            flow_id: flow.id,
            timestamp: Utc::now(),
            severity: decision.severity,
            attack_type: decision.attack_type.clone(),
            threat_score: decision.final_risk,
            decision: decision.verdict,
            status: "open".to_string(),
            priority: decision.priority,
            metadata,
        })
    }
}

fn epoch_to_datetime(epoch: f64) -> DateTime<Utc> {
    let secs = epoch.trunc() as i64;
    let nanos = ((epoch.fract().abs()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
}

/// Thread-safe database handle shared by the inference workers
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open database {}", path.as_ref().display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(DB_BUSY_TIMEOUT)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database for tests
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                src_ip TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                src_port INTEGER NOT NULL,
                dst_port INTEGER NOT NULL,
                protocol INTEGER NOT NULL,
                duration REAL NOT NULL DEFAULT 0,
                total_fwd_packets INTEGER NOT NULL DEFAULT 0,
                total_bwd_packets INTEGER NOT NULL DEFAULT 0,
                flow_bytes_per_s REAL NOT NULL DEFAULT 0,
                flow_packets_per_s REAL NOT NULL DEFAULT 0,
                close_reason TEXT,
                raw_features TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_flows_timestamp ON flows(timestamp DESC);

            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL REFERENCES flows(id),
                timestamp TEXT NOT NULL,
                predicted_label TEXT NOT NULL,
                confidence REAL NOT NULL,
                class_probabilities TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_label ON predictions(predicted_label);

            CREATE TABLE IF NOT EXISTS anomaly_scores (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL REFERENCES flows(id),
                timestamp TEXT NOT NULL,
                reconstruction_error REAL NOT NULL,
                anomaly_score REAL NOT NULL,
                threshold_used REAL NOT NULL,
                is_anomaly INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL REFERENCES flows(id),
                timestamp TEXT NOT NULL,
                severity TEXT NOT NULL,
                attack_type TEXT,
                threat_score REAL NOT NULL,
                decision TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                priority INTEGER NOT NULL DEFAULT 5,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_severity_time ON alerts(severity, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_alerts_flow ON alerts(flow_id);
            "#,
        )?;
        Ok(())
    }

    /// Persist one analysed flow atomically
    pub fn insert_detection(
        &self,
        flow: &FlowRecord,
        prediction: &PredictionRecord,
        anomaly: &AnomalyRecord,
        alert: Option<&AlertRecord>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO flows (id, timestamp, src_ip, dst_ip, src_port, dst_port, protocol,
                                duration, total_fwd_packets, total_bwd_packets,
                                flow_bytes_per_s, flow_packets_per_s, close_reason, raw_features)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                flow.id.to_string(),
                flow.timestamp.to_rfc3339(),
                flow.src_ip,
                flow.dst_ip,
                flow.src_port,
                flow.dst_port,
                flow.protocol,
                flow.duration,
                flow.total_fwd_packets,
                flow.total_bwd_packets,
                flow.flow_bytes_per_s,
                flow.flow_packets_per_s,
                flow.close_reason,
                flow.raw_features
                    .as_ref()
                    .map(|f| serde_json::to_string(f).unwrap_or_default()),
            ],
        )?;

        tx.execute(
            "INSERT INTO predictions (id, flow_id, timestamp, predicted_label, confidence, class_probabilities)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                prediction.id.to_string(),
                prediction.flow_id.to_string(),
                prediction.timestamp.to_rfc3339(),
                prediction.predicted_label,
                prediction.confidence,
                prediction.class_probabilities.to_string(),
            ],
        )?;

        tx.execute(
            "INSERT INTO anomaly_scores (id, flow_id, timestamp, reconstruction_error,
                                         anomaly_score, threshold_used, is_anomaly)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                anomaly.id.to_string(),
                anomaly.flow_id.to_string(),
                anomaly.timestamp.to_rfc3339(),
                anomaly.reconstruction_error,
                anomaly.anomaly_score,
                anomaly.threshold_used,
                anomaly.is_anomaly,
            ],
        )?;

        if let Some(alert) = alert {
            tx.execute(
                "INSERT INTO alerts (id, flow_id, timestamp, severity, attack_type, threat_score,
                                     decision, status, priority, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    alert.id.to_string(),
                    alert.flow_id.to_string(),
                    alert.timestamp.to_rfc3339(),
                    alert.severity.as_str(),
                    alert.attack_type,
                    alert.threat_score,
                    alert.decision.as_str(),
                    alert.status,
                    alert.priority,
                    alert.metadata.to_string(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn flow_count(&self) -> Result<u64> {
        self.count("flows")
    }

    pub fn alert_count(&self) -> Result<u64> {
        self.count("alerts")
    }

    pub fn prediction_count(&self) -> Result<u64> {
        self.count("predictions")
    }

    pub fn anomaly_count(&self) -> Result<u64> {
        self.count("anomaly_scores")
    }

    fn count(&self, table: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Liveness probe for the health endpoint
    pub fn ping(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpProtocol, PacketRecord};
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_flow() -> Flow {
        Flow::new(&PacketRecord {
            timestamp: 1_700_000_000.0,
            src_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 40000,
            dst_port: 443,
            protocol: IpProtocol::Tcp,
            size: 100,
            tcp_flags: 0x02,
            tcp_window: 1024,
            payload_size: 0,
        })
    }

    fn sample_records(flow: &Flow) -> (FlowRecord, PredictionRecord, AnomalyRecord) {
        let sup = SupervisedOutput {
            predicted_label: "DDoS".into(),
            confidence: 0.95,
            is_attack: true,
            class_probabilities: BTreeMap::new(),
        };
        let unsup = UnsupervisedOutput {
            reconstruction_error: 0.2,
            anomaly_score: 0.9,
            is_anomaly: true,
            threshold_used: 0.025,
        };
        (
            FlowRecord::from_flow(flow, Some(vec![1.0, 2.0])),
            PredictionRecord::new(flow.id, &sup),
            AnomalyRecord::new(flow.id, &unsup),
        )
    }

    #[test]
    fn test_insert_with_alert() {
        let db = Database::open_memory().unwrap();
        let flow = sample_flow();
        let (fr, pr, ar) = sample_records(&flow);
        let decision = Decision {
            verdict: Verdict::ConfirmedAttack,
            severity: Severity::Critical,
            priority: 1,
            final_risk: 0.9,
            attack_type: Some("DDoS".into()),
            supervised_risk: 0.95,
            anomaly_score: 0.9,
            ip_reputation: 0.5,
        };
        let alert = AlertRecord::from_decision(&flow, &decision, Value::Null).unwrap();

        db.insert_detection(&fr, &pr, &ar, Some(&alert)).unwrap();
        assert_eq!(db.flow_count().unwrap(), 1);
        assert_eq!(db.prediction_count().unwrap(), 1);
        assert_eq!(db.anomaly_count().unwrap(), 1);
        assert_eq!(db.alert_count().unwrap(), 1);
    }

    #[test]
    fn test_insert_without_alert() {
        let db = Database::open_memory().unwrap();
        let flow = sample_flow();
        let (fr, pr, ar) = sample_records(&flow);

        db.insert_detection(&fr, &pr, &ar, None).unwrap();
        assert_eq!(db.flow_count().unwrap(), 1);
        assert_eq!(db.alert_count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_flow_rolls_back_everything() {
        let db = Database::open_memory().unwrap();
        let flow = sample_flow();
        let (fr, pr, ar) = sample_records(&flow);
        db.insert_detection(&fr, &pr, &ar, None).unwrap();

        // Same flow id again: primary key violation on the first insert
        let (fr2, mut pr2, mut ar2) = sample_records(&flow);
        pr2.id = Uuid::new_v4();
        ar2.id = Uuid::new_v4();
        assert!(db.insert_detection(&fr2, &pr2, &ar2, None).is_err());

        assert_eq!(db.flow_count().unwrap(), 1);
        assert_eq!(db.prediction_count().unwrap(), 1);
    }

    #[test]
    fn test_no_alert_for_normal_verdict() {
        let flow = sample_flow();
        let decision = Decision {
            verdict: Verdict::Normal,
            severity: Severity::Low,
            priority: 5,
            final_risk: 0.05,
            attack_type: None,
            supervised_risk: 0.05,
            anomaly_score: 0.0,
            ip_reputation: 0.0,
        };
        assert!(AlertRecord::from_decision(&flow, &decision, Value::Null).is_none());
    }

    #[test]
    fn test_ping() {
        let db = Database::open_memory().unwrap();
        assert!(db.ping());
    }
}
