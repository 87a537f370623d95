//! HTTP surface
//!
//! The status endpoints the operations layer consumes: capture control,
//! model status, synchronous analysis and the health probe. Read-side
//! query routes (alert listing, dashboards) live in a separate service.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::PipelineError;
use crate::inference::AnalysisResult;
use crate::pipeline::Pipeline;
use crate::ws;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

fn error_response(err: PipelineError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        PipelineError::AlreadyRunning | PipelineError::CaptureActive => StatusCode::CONFLICT,
        PipelineError::UnknownInterface(_) => StatusCode::NOT_FOUND,
        PipelineError::BadVector { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Degraded(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::CaptureSetup(_) | PipelineError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/capture/status", get(capture_status))
        .route("/api/capture/start", post(start_capture))
        .route("/api/capture/stop", post(stop_capture))
        .route("/api/capture/interfaces", get(interfaces))
        .route("/api/capture/interface", put(set_interface))
        .route("/api/models/status", get(models_status))
        .route("/api/metrics", get(metrics))
        .route("/api/analyze", post(analyze))
        .route("/ws/alerts", get(ws::alerts_handler))
        .with_state(pipeline)
}

/// Bind and serve until the process exits
pub async fn serve(pipeline: Arc<Pipeline>, addr: &str) -> anyhow::Result<()> {
    let app = router(pipeline);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("api listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(pipeline): State<Arc<Pipeline>>) -> Json<Value> {
    let services = pipeline.health().await;
    let healthy = services.database && services.pubsub;
    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "services": services,
    }))
}

async fn capture_status(State(pipeline): State<Arc<Pipeline>>) -> Json<Value> {
    Json(serde_json::to_value(pipeline.capture_status()).unwrap_or(Value::Null))
}

async fn start_capture(State(pipeline): State<Arc<Pipeline>>) -> ApiResult<Value> {
    pipeline.start().map_err(error_response)?;
    Ok(Json(json!({ "running": true })))
}

async fn stop_capture(State(pipeline): State<Arc<Pipeline>>) -> Json<Value> {
    pipeline.stop();
    Json(json!({ "running": false }))
}

async fn interfaces(State(pipeline): State<Arc<Pipeline>>) -> ApiResult<Value> {
    let names = pipeline.list_interfaces().map_err(error_response)?;
    Ok(Json(json!({ "interfaces": names })))
}

#[derive(Debug, Deserialize)]
struct SetInterfaceRequest {
    interface: String,
}

async fn set_interface(
    State(pipeline): State<Arc<Pipeline>>,
    Json(req): Json<SetInterfaceRequest>,
) -> ApiResult<Value> {
    pipeline
        .set_interface(&req.interface)
        .map_err(error_response)?;
    Ok(Json(json!({ "interface": req.interface })))
}

async fn models_status(State(pipeline): State<Arc<Pipeline>>) -> Json<Value> {
    Json(serde_json::to_value(pipeline.models_status()).unwrap_or(Value::Null))
}

async fn metrics(State(pipeline): State<Arc<Pipeline>>) -> Json<Value> {
    Json(serde_json::to_value(pipeline.metrics()).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    features: Vec<f32>,
    #[serde(default)]
    ip_reputation: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    #[serde(flatten)]
    result: AnalysisResult,
}

async fn analyze(
    State(pipeline): State<Arc<Pipeline>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<AnalyzeResponse> {
    let result = pipeline
        .analyze(&req.features, req.ip_reputation)
        .map_err(error_response)?;
    Ok(Json(AnalyzeResponse { result }))
}
