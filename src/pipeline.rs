//! Pipeline wiring
//!
//! One `Pipeline` owns every stage explicitly: the sniffer and its ring,
//! the flow task, the inference pool, the datastore and the alert bus.
//! `start`/`stop` are its methods; nothing lives in globals.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::capture::{list_interfaces, CaptureStatus, Sniffer};
use crate::config::Config;
use crate::db::Database;
use crate::decision::DecisionEngine;
use crate::error::PipelineError;
use crate::flow::{FlowBuilder, FlowConfig};
use crate::inference::{
    analyze_vector, run_publisher, AnalysisResult, InferencePool, UNKNOWN_REPUTATION,
};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::ml::{ModelBundle, ModelsStatus, Z_MAX};
use crate::pubsub::{AlertBus, MemoryBus, RedisBus};

/// Flow task pause when the ring is empty
const IDLE_TICK: Duration = Duration::from_millis(50);
/// Records drained from the ring per iteration
const DRAIN_BATCH: usize = 1024;
/// Queue between workers and the publisher task
const ALERT_QUEUE_DEPTH: usize = 1024;

/// Per-dependency health booleans
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub database: bool,
    pub pubsub: bool,
    pub capture: bool,
    pub models: bool,
}

struct RunningState {
    flow_stop: Arc<AtomicBool>,
    flow_handle: std::thread::JoinHandle<()>,
    pool: InferencePool,
    publisher: tokio::task::JoinHandle<()>,
}

/// The detection pipeline from capture to alert publication
pub struct Pipeline {
    config: Config,
    sniffer: Sniffer,
    db: Database,
    bus: Arc<dyn AlertBus>,
    bundle: Arc<Option<ModelBundle>>,
    engine: Arc<DecisionEngine>,
    metrics: Arc<PipelineMetrics>,
    /// Live size of the flow table, maintained by the flow task
    active_flows: Arc<AtomicUsize>,
    running: Mutex<Option<RunningState>>,
}

impl Pipeline {
    /// Build the pipeline from configuration
    ///
    /// A missing or broken artifact bundle is not fatal: the pipeline comes
    /// up degraded with capture available and inference skipped.
    pub async fn new(config: Config) -> Result<Self> {
        let metrics = Arc::new(PipelineMetrics::default());

        let db = Database::open(&config.storage.database_path)?;

        let bus: Arc<dyn AlertBus> = match &config.storage.redis_url {
            Some(url) => match RedisBus::connect(url).await {
                Ok(bus) => Arc::new(bus),
                Err(e) => {
                    warn!("redis unavailable, falling back to in-process bus: {:#}", e);
                    Arc::new(MemoryBus::new())
                }
            },
            None => Arc::new(MemoryBus::new()),
        };

        let bundle = match ModelBundle::load(
            &config.inference.model_dir,
            config.inference.anomaly_threshold_k,
            config.inference.min_classification_confidence,
            Z_MAX,
        ) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!("running degraded, detection disabled: {:#}", e);
                None
            }
        };

        let engine = Arc::new(DecisionEngine::new(
            config.decision.weight_supervised,
            config.decision.weight_unsupervised,
            config.decision.weight_reputation,
            config.decision.threshold_attack,
        ));

        let sniffer = Sniffer::new(
            config.capture.interface.clone(),
            config.capture.buffer_size,
            metrics.clone(),
        );

        Ok(Self {
            config,
            sniffer,
            db,
            bus,
            bundle: Arc::new(bundle),
            engine,
            metrics,
            active_flows: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        })
    }

    /// Start capture, the flow task, the workers and the publisher
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        self.sniffer.start()?;

        let (alert_tx, alert_rx) = mpsc::channel(ALERT_QUEUE_DEPTH);
        let publisher = tokio::spawn(run_publisher(
            alert_rx,
            self.bus.clone(),
            self.metrics.clone(),
        ));

        let pool = InferencePool::spawn(
            self.config.inference.actual_workers(),
            self.config.inference.queue_size,
            self.bundle.clone(),
            self.engine.clone(),
            self.db.clone(),
            self.metrics.clone(),
            alert_tx,
        );

        let flow_stop = Arc::new(AtomicBool::new(false));
        let flow_handle = self.spawn_flow_task(flow_stop.clone(), pool.sender());

        *running = Some(RunningState {
            flow_stop,
            flow_handle,
            pool,
            publisher,
        });
        info!("pipeline started");
        Ok(())
    }

    /// Stop in dependency order: capture, drain, flows, workers, publisher
    ///
    /// Idempotent; stopping a stopped pipeline is a no-op.
    pub fn stop(&self) {
        let state = self.running.lock().take();
        let Some(state) = state else {
            return;
        };

        self.sniffer.stop();

        state.flow_stop.store(true, Ordering::SeqCst);
        let _ = state.flow_handle.join();

        // Workers are joined and their publisher handles dropped, so the
        // publisher task drains the remaining alerts and exits on its own.
        state.pool.shutdown();
        drop(state.publisher);
        info!("pipeline stopped");
    }

    fn spawn_flow_task(
        &self,
        stop: Arc<AtomicBool>,
        flow_tx: crossbeam_channel::Sender<crate::core::Flow>,
    ) -> std::thread::JoinHandle<()> {
        let ring = self.sniffer.ring();
        let metrics = self.metrics.clone();
        let active_flows = self.active_flows.clone();
        let flow_config = FlowConfig {
            idle_timeout: self.config.capture.flow_timeout,
            max_duration: self.config.capture.max_flow_duration,
            ..FlowConfig::default()
        };

        std::thread::Builder::new()
            .name("netsentry-flow".to_string())
            .spawn(move || {
                let mut builder = FlowBuilder::new(flow_config);

                loop {
                    let stopping = stop.load(Ordering::SeqCst);
                    let batch = ring.drain(DRAIN_BATCH);
                    let idle = batch.is_empty();

                    let mut completed = builder.ingest(batch);
                    completed.extend(builder.poll_timeouts(now_epoch()));

                    if stopping {
                        // Best-effort flush of in-flight flows before exit
                        completed.extend(builder.force_complete_all());
                    }

                    for flow in completed {
                        PipelineMetrics::incr(&metrics.flows_completed);
                        InferencePool::submit(&flow_tx, flow, &metrics);
                    }
                    active_flows.store(builder.active_count(), Ordering::Relaxed);

                    if stopping && ring.is_empty() {
                        break;
                    }
                    if idle {
                        std::thread::sleep(IDLE_TICK);
                    }
                }
                active_flows.store(0, Ordering::Relaxed);
            })
            .expect("failed to spawn flow task")
    }

    /// Synchronous inference entry for the REST `/analyze` route
    pub fn analyze(
        &self,
        vector: &[f32],
        ip_reputation: Option<f64>,
    ) -> Result<AnalysisResult, PipelineError> {
        let bundle = self.bundle.as_ref().as_ref().ok_or_else(|| {
            PipelineError::Degraded("model artifacts are not loaded".to_string())
        })?;
        analyze_vector(
            bundle,
            &self.engine,
            vector,
            ip_reputation.unwrap_or(UNKNOWN_REPUTATION),
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Sniffer status overlaid with the flow-table counts the sniffer
    /// itself cannot see
    pub fn capture_status(&self) -> CaptureStatus {
        let mut status = self.sniffer.status();
        status.active_flows = self.active_flows.load(Ordering::Relaxed);
        status.completed_flows = self.metrics.flows_completed.load(Ordering::Relaxed);
        status
    }

    pub fn models_status(&self) -> ModelsStatus {
        ModelsStatus::from_bundle(&self.config.inference.model_dir, self.bundle.as_ref().as_ref())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn list_interfaces(&self) -> Result<Vec<String>, PipelineError> {
        list_interfaces().map_err(PipelineError::Internal)
    }

    pub fn set_interface(&self, name: &str) -> Result<(), PipelineError> {
        self.sniffer.set_interface(name)
    }

    pub fn bus(&self) -> Arc<dyn AlertBus> {
        self.bus.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Per-dependency health; each can degrade independently
    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            database: self.db.ping(),
            pubsub: self.bus.ping().await,
            capture: self.sniffer.is_running(),
            models: self.bundle.is_some(),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
