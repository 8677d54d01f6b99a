//! Health predictor agent
//!
//! Loads the trained models once, then predicts equipment health on a fixed
//! interval and on demand through the HTTP API.

use anyhow::{Context, Result};
use health_agent::{api, config::PredictorConfig};
use health_lib::{
    health::{components, HealthRegistry},
    observability::{PredictorMetrics, StructuredLogger},
    predictor::{PredictionPipeline, PredictionScheduler},
    registry::{ModelKind, ModelRegistry},
    store::{MemoryStore, ReadingSource, ResultSink, SupabaseStore},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PREDICTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = PredictorConfig::load()?;
    info!(instance = %config.instance_name, model_dir = %config.model_dir, "Predictor configured");

    let registry = Arc::new(ModelRegistry::load(&config.model_dir));

    let health_registry = HealthRegistry::new();
    for component in [components::PIPELINE, components::SOURCE, components::SINK] {
        health_registry.register(component).await;
    }
    health_registry
        .record_registry(registry.fallback_count(), ModelKind::ALL.len())
        .await;

    let metrics = PredictorMetrics::new();
    metrics.set_model_origins(&registry);

    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(PREDICTOR_VERSION, &config.model_dir, registry.fallback_count());

    let (source, sink): (Arc<dyn ReadingSource>, Arc<dyn ResultSink>) = match config.supabase() {
        Some(supabase) => {
            let store = Arc::new(SupabaseStore::new(&supabase).context("Failed to create Supabase client")?);
            info!(url = %supabase.url, "Using Supabase data store");
            let source: Arc<dyn ReadingSource> = store.clone();
            let sink: Arc<dyn ResultSink> = store;
            (source, sink)
        }
        None => {
            warn!("No data store configured, using the in-memory store");
            let store = Arc::new(MemoryStore::new());
            let source: Arc<dyn ReadingSource> = store.clone();
            let sink: Arc<dyn ResultSink> = store;
            (source, sink)
        }
    };

    let pipeline = Arc::new(
        PredictionPipeline::new(registry, source, sink)
            .with_health(health_registry.clone())
            .with_logger(logger.clone()),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler = PredictionScheduler::new(pipeline.clone(), config.prediction_interval());
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics, pipeline));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API server task panicked"),
            }
        }
    }

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Prediction scheduler task failed");
    }
    info!("Shutdown complete");

    Ok(())
}
