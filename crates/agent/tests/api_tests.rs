//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use health_agent::api::{create_router, AppState};
use health_lib::{
    health::{components, HealthRegistry},
    observability::PredictorMetrics,
    predictor::PredictionPipeline,
    registry::ModelRegistry,
    store::MemoryStore,
    SensorReading, NUM_FEATURES,
};
use std::sync::Arc;
use tower::ServiceExt;

fn reading(second: u32) -> SensorReading {
    let timestamp = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(12, 0, second))
        .unwrap();
    SensorReading::new("fridge-01", timestamp, [0.5; NUM_FEATURES])
}

async fn setup_test_app(store: Arc<MemoryStore>) -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::PIPELINE).await;
    health_registry.register(components::SOURCE).await;

    let registry = Arc::new(ModelRegistry::fallback());
    let pipeline = Arc::new(PredictionPipeline::new(registry, store.clone(), store).with_health(health_registry.clone()));
    let state = Arc::new(AppState::new(health_registry, PredictorMetrics::new(), pipeline));
    let router = create_router(state.clone());

    (router, state)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app(Arc::new(MemoryStore::new())).await;

    let response = app.oneshot(get("/healthz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app(Arc::new(MemoryStore::new())).await;
    state.health_registry.record_registry(3, 8).await;

    let response = app.oneshot(get("/healthz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app(Arc::new(MemoryStore::new())).await;
    state
        .health_registry
        .set_unhealthy(components::SINK, "insert rejected")
        .await;

    let response = app.oneshot(get("/healthz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let (app, state) = setup_test_app(Arc::new(MemoryStore::new())).await;

    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["ready"], false);

    state.health_registry.set_ready(true).await;
    let response = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_predictor_metrics() {
    let (app, state) = setup_test_app(Arc::new(MemoryStore::new())).await;
    state.metrics.set_model_origins(&ModelRegistry::fallback());
    state.metrics.inc_tick("skipped");

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("health_predictor_ticks_total"));
    assert!(text.contains("health_predictor_model_origin_info"));
}

#[tokio::test]
async fn test_models_endpoint_lists_fallbacks() {
    let (app, _state) = setup_test_app(Arc::new(MemoryStore::new())).await;

    let response = app.oneshot(get("/api/models")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["fallbacks"], 8);
    assert_eq!(body["threshold"], 0.5);
    assert_eq!(body["models"].as_array().unwrap().len(), 8);
    assert_eq!(body["models"][1]["model"], "rul");
    assert_eq!(body["models"][1]["origin"], "fallback");
}

#[tokio::test]
async fn test_run_pipeline_skips_without_readings() {
    let store = Arc::new(MemoryStore::new());
    let (app, _state) = setup_test_app(store.clone()).await;

    let response = app.oneshot(post("/api/predictions/run-pipeline")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let report = json_body(response).await;
    assert_eq!(report["trigger"], "manual");
    assert_eq!(report["status"], "skipped");
    assert_eq!(store.store_calls(), 0);
}

#[tokio::test]
async fn test_run_pipeline_reports_failed_task() {
    // untrained forests abort the tick at the failure-probability task
    let store = Arc::new(MemoryStore::with_readings((0..11).map(reading).collect()));
    let (app, _state) = setup_test_app(store.clone()).await;

    let response = app.oneshot(post("/api/predictions/run-pipeline")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let report = json_body(response).await;
    assert_eq!(report["status"], "failed");
    assert_eq!(report["task"], "failure_probability");
    assert_eq!(store.store_calls(), 0);
}

#[tokio::test]
async fn test_run_pipeline_requires_post() {
    let (app, _state) = setup_test_app(Arc::new(MemoryStore::new())).await;

    let response = app.oneshot(get("/api/predictions/run-pipeline")).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
