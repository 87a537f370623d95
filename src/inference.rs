//! Inference workers
//!
//! N workers drain the bounded flow queue. Each one runs the preprocessing
//! chain, both predictors and the decision engine, persists the result in
//! one transaction, and hands any alert to the single publisher task.
//! Workers hold only shared read-only references to the loaded artifacts.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::Flow;
use crate::db::{AlertRecord, AnomalyRecord, Database, FlowRecord, PredictionRecord};
use crate::decision::{Decision, DecisionEngine};
use crate::error::PipelineError;
use crate::features;
use crate::metrics::PipelineMetrics;
use crate::ml::{ModelBundle, SupervisedOutput, UnsupervisedOutput};
use crate::pubsub::{AlertBus, THREAT_SCORE_ALPHA};

/// Reputation assigned to live traffic when no provider is wired in
pub const UNKNOWN_REPUTATION: f64 = 0.5;

/// Deadline for one pub/sub publish
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of scoring one feature vector
#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalysisResult {
    pub supervised: SupervisedOutput,
    pub unsupervised: UnsupervisedOutput,
    pub decision: Decision,
}

/// Score a raw feature vector through the full inference path
///
/// Deterministic: the same vector and artifacts always produce the same
/// output. Used by the workers and by the synchronous `/analyze` entry.
pub fn analyze_vector(
    bundle: &ModelBundle,
    engine: &DecisionEngine,
    raw: &[f32],
    ip_reputation: f64,
) -> Result<AnalysisResult, PipelineError> {
    let expected = bundle.preprocessor.input_dim();
    if raw.len() != expected {
        return Err(PipelineError::BadVector {
            expected,
            got: raw.len(),
        });
    }

    let prepared = bundle
        .preprocessor
        .transform(raw)
        .map_err(PipelineError::Internal)?;

    let supervised = bundle.supervised.predict(&prepared);
    let unsupervised = bundle.unsupervised.predict(&prepared);
    let decision = engine.decide(&supervised, &unsupervised, ip_reputation.clamp(0.0, 1.0));

    Ok(AnalysisResult {
        supervised,
        unsupervised,
        decision,
    })
}

/// Alert handed from a worker to the publisher task after its transaction
/// committed
#[derive(Debug)]
pub struct AlertEvent {
    pub payload: String,
    pub final_risk: f64,
}

/// Run one completed flow through extract → score → persist → hand off
///
/// Returns the alert record when one was written. All failure modes are
/// counted rather than propagated; a dropped flow will not reappear.
pub fn process_flow(
    flow: &Flow,
    bundle: &ModelBundle,
    engine: &DecisionEngine,
    db: &Database,
    metrics: &PipelineMetrics,
    alert_tx: Option<&mpsc::Sender<AlertEvent>>,
) -> Option<AlertRecord> {
    let vector = features::extract(flow);

    let analysis = match analyze_vector(bundle, engine, &vector, UNKNOWN_REPUTATION) {
        Ok(analysis) => analysis,
        Err(e) => {
            PipelineMetrics::incr(&metrics.inference_errors);
            warn!("inference failed for flow {}: {}", flow.id, e);
            return None;
        }
    };

    let flow_record = FlowRecord::from_flow(flow, Some(vector));
    let prediction = PredictionRecord::new(flow.id, &analysis.supervised);
    let anomaly = AnomalyRecord::new(flow.id, &analysis.unsupervised);
    let alert = AlertRecord::from_decision(
        flow,
        &analysis.decision,
        analysis.decision.details(engine.weights()),
    );

    if let Err(e) = db.insert_detection(&flow_record, &prediction, &anomaly, alert.as_ref()) {
        PipelineMetrics::incr(&metrics.db_failures);
        error!("persistence failed for flow {}, dropping: {:#}", flow.id, e);
        return None;
    }
    PipelineMetrics::incr(&metrics.flows_analyzed);

    let alert = alert?;
    PipelineMetrics::incr(&metrics.alerts_created);
    debug!(
        "alert {}: {} {} risk={:.3}",
        alert.id,
        alert.severity.as_str(),
        alert.decision.as_str(),
        alert.threat_score
    );

    if let Some(tx) = alert_tx {
        match serde_json::to_string(&alert) {
            Ok(payload) => {
                let event = AlertEvent {
                    payload,
                    final_risk: analysis.decision.final_risk,
                };
                if tx.blocking_send(event).is_err() {
                    PipelineMetrics::incr(&metrics.publish_failures);
                }
            }
            Err(e) => {
                PipelineMetrics::incr(&metrics.publish_failures);
                warn!("alert serialisation failed: {}", e);
            }
        }
    }
    Some(alert)
}

/// The worker pool consuming the flow queue
pub struct InferencePool {
    flow_tx: Option<Sender<Flow>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl InferencePool {
    /// Spawn `workers` threads over a bounded queue of `queue_size` flows
    pub fn spawn(
        workers: usize,
        queue_size: usize,
        bundle: Arc<Option<ModelBundle>>,
        engine: Arc<DecisionEngine>,
        db: Database,
        metrics: Arc<PipelineMetrics>,
        alert_tx: mpsc::Sender<AlertEvent>,
    ) -> Self {
        let (flow_tx, flow_rx) = crossbeam_channel::bounded::<Flow>(queue_size.max(1));

        let handles = (0..workers.max(1))
            .map(|i| {
                let rx: Receiver<Flow> = flow_rx.clone();
                let bundle = bundle.clone();
                let engine = engine.clone();
                let db = db.clone();
                let metrics = metrics.clone();
                let alert_tx = alert_tx.clone();
                std::thread::Builder::new()
                    .name(format!("netsentry-infer-{}", i))
                    .spawn(move || {
                        while let Ok(flow) = rx.recv() {
                            match bundle.as_ref() {
                                Some(bundle) => {
                                    process_flow(
                                        &flow,
                                        bundle,
                                        &engine,
                                        &db,
                                        &metrics,
                                        Some(&alert_tx),
                                    );
                                }
                                None => {
                                    // Degraded mode: capture keeps running,
                                    // flows are dropped without scoring.
                                    PipelineMetrics::incr(&metrics.inference_skipped);
                                }
                            }
                        }
                    })
                    .expect("failed to spawn inference worker")
            })
            .collect();

        info!("inference pool started ({} workers)", workers.max(1));
        Self {
            flow_tx: Some(flow_tx),
            handles,
        }
    }

    /// Queue handle for the flow task
    pub fn sender(&self) -> Sender<Flow> {
        self.flow_tx.clone().expect("pool already shut down")
    }

    /// Enqueue a completed flow; full queue drops it, stalling capture is
    /// worse than losing one observation.
    pub fn submit(tx: &Sender<Flow>, flow: Flow, metrics: &PipelineMetrics) {
        match tx.try_send(flow) {
            Ok(()) => {}
            Err(TrySendError::Full(flow)) => {
                PipelineMetrics::incr(&metrics.flows_dropped);
                debug!("inference queue full, dropping flow {}", flow.id);
            }
            Err(TrySendError::Disconnected(_)) => {
                PipelineMetrics::incr(&metrics.flows_dropped);
            }
        }
    }

    /// Close the queue and wait for in-flight flows to finish
    pub fn shutdown(mut self) {
        self.flow_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("inference pool stopped");
    }
}

/// Single publisher task: pub/sub delivery and the smoothed threat score
///
/// Runs after the transaction commits, so the datastore never trails the
/// channel. Publish failures are counted and swallowed.
pub async fn run_publisher(
    mut rx: mpsc::Receiver<AlertEvent>,
    bus: Arc<dyn AlertBus>,
    metrics: Arc<PipelineMetrics>,
) {
    let mut smoothed = 0.0f64;
    while let Some(event) = rx.recv().await {
        // Transient broker trouble gets one retry, then the alert is
        // dropped and counted; the datastore copy already committed.
        let mut published = false;
        for attempt in 0..2 {
            match tokio::time::timeout(PUBLISH_TIMEOUT, bus.publish_alert(&event.payload)).await {
                Ok(Ok(())) => {
                    published = true;
                    break;
                }
                Ok(Err(e)) => warn!("alert publish failed (attempt {}): {:#}", attempt + 1, e),
                Err(_) => warn!("alert publish timed out (attempt {})", attempt + 1),
            }
        }
        if published {
            PipelineMetrics::incr(&metrics.alerts_published);
        } else {
            PipelineMetrics::incr(&metrics.publish_failures);
        }

        smoothed = THREAT_SCORE_ALPHA * event.final_risk + (1.0 - THREAT_SCORE_ALPHA) * smoothed;
        if let Ok(Err(e)) =
            tokio::time::timeout(PUBLISH_TIMEOUT, bus.set_threat_score(smoothed)).await
        {
            warn!("threat score update failed: {:#}", e);
        }
    }
    debug!("publisher task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryBus;

    #[tokio::test]
    async fn test_publisher_smooths_threat_score() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(PipelineMetrics::default());
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(run_publisher(
            rx,
            bus.clone() as Arc<dyn AlertBus>,
            metrics.clone(),
        ));

        tx.send(AlertEvent {
            payload: "{}".into(),
            final_risk: 1.0,
        })
        .await
        .unwrap();
        tx.send(AlertEvent {
            payload: "{}".into(),
            final_risk: 0.5,
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        // 0.3·1.0 → 0.3, then 0.3·0.5 + 0.7·0.3 = 0.36
        assert!((bus.threat_score() - 0.36).abs() < 1e-9);
        assert_eq!(metrics.snapshot().alerts_published, 2);
    }

    #[tokio::test]
    async fn test_publisher_counts_each_message() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(PipelineMetrics::default());
        let (tx, rx) = mpsc::channel(8);
        let mut sub = bus.subscribe().await.unwrap();

        let task = tokio::spawn(run_publisher(
            rx,
            bus.clone() as Arc<dyn AlertBus>,
            metrics.clone(),
        ));

        tx.send(AlertEvent {
            payload: "alpha".into(),
            final_risk: 0.9,
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), "alpha");
        assert_eq!(metrics.snapshot().publish_failures, 0);
    }
}
