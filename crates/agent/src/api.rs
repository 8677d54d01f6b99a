//! HTTP API for health checks, metrics, the model summary and manual ticks

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use health_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::PredictorMetrics,
    predictor::{PredictionPipeline, TickStatus, TickTrigger},
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: PredictorMetrics,
    pub pipeline: Arc<PredictionPipeline>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: PredictorMetrics, pipeline: Arc<PredictionPipeline>) -> Self {
        Self {
            health_registry,
            metrics,
            pipeline,
        }
    }
}

/// 200 while operational (healthy or degraded), 503 when unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Origin and digest of every model slot
async fn models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.pipeline.registry();
    Json(serde_json::json!({
        "fallbacks": registry.fallback_count(),
        "threshold": registry.threshold(),
        "models": registry.summary(),
    }))
}

/// Run one tick now; waits for a scheduled tick already in flight
async fn run_pipeline(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!(event = "manual_trigger", "Prediction pipeline triggered manually");
    let report = state.pipeline.run_tick(TickTrigger::Manual).await;

    let status_code = match report.status {
        TickStatus::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        TickStatus::Completed { .. } | TickStatus::Skipped { .. } => StatusCode::OK,
    };

    (status_code, Json(report))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/models", get(models))
        .route("/api/predictions/run-pipeline", post(run_pipeline))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
