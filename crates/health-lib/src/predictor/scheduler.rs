//! Prediction pipeline and scheduling loop
//!
//! One tick fetches the latest readings, builds a window, runs the
//! orchestrator, assembles the result and stores it. Scheduled and manual
//! ticks share one async mutex, so at most one tick is in flight.

use super::inference::{InferenceOrchestrator, TaskKind, TickError};
use super::output::ResultAssembler;
use crate::health::{components, HealthRegistry};
use crate::models::{FeatureWindow, PredictionResult, SEQUENCE_LENGTH};
use crate::observability::{PredictorMetrics, StructuredLogger};
use crate::registry::ModelRegistry;
use crate::store::{ReadingSource, ResultSink};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Default time between scheduled ticks
pub const DEFAULT_PREDICTION_INTERVAL: Duration = Duration::from_secs(60);

/// What started a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickTrigger {
    Scheduled,
    Manual,
}

impl TickTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickTrigger::Scheduled => "scheduled",
            TickTrigger::Manual => "manual",
        }
    }
}

/// How a tick ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TickStatus {
    /// A result was produced; `stored` is false when the sink rejected it
    Completed { stored: bool },
    /// No inference ran
    Skipped { reason: String },
    /// An abort-tick task failed
    Failed { task: TaskKind, error: String },
}

impl TickStatus {
    pub fn outcome(&self) -> &'static str {
        match self {
            TickStatus::Completed { .. } => "completed",
            TickStatus::Skipped { .. } => "skipped",
            TickStatus::Failed { .. } => "failed",
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub trigger: TickTrigger,
    #[serde(flatten)]
    pub status: TickStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PredictionResult>,
    /// Tasks that used their default output
    pub degraded: Vec<TaskKind>,
    pub duration_us: u64,
}

/// Fetch → transform → infer → assemble → store
pub struct PredictionPipeline {
    orchestrator: InferenceOrchestrator,
    assembler: ResultAssembler,
    source: Arc<dyn ReadingSource>,
    sink: Arc<dyn ResultSink>,
    window_length: usize,
    metrics: PredictorMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
    tick_lock: Mutex<()>,
}

impl PredictionPipeline {
    pub fn new(registry: Arc<ModelRegistry>, source: Arc<dyn ReadingSource>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            orchestrator: InferenceOrchestrator::new(registry),
            assembler: ResultAssembler::new(),
            source,
            sink,
            window_length: SEQUENCE_LENGTH,
            metrics: PredictorMetrics::new(),
            logger: StructuredLogger::new("health-predictor"),
            health: None,
            tick_lock: Mutex::new(()),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.orchestrator.registry()
    }

    /// Run one tick; waits for a tick already in flight
    pub async fn run_tick(&self, trigger: TickTrigger) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        let start = Instant::now();

        let (status, result, degraded) = self.execute().await;

        let duration = start.elapsed();
        self.metrics.observe_tick_latency(duration.as_secs_f64());
        self.metrics.inc_tick(status.outcome());
        let duration_us = duration.as_micros() as u64;

        match &status {
            TickStatus::Completed { stored } => {
                if let Some(result) = &result {
                    self.logger.log_prediction(result, *stored, duration_us);
                }
                if degraded.is_empty() {
                    self.set_health(components::PIPELINE, None).await;
                } else {
                    let names: Vec<&str> = degraded.iter().map(|t| t.as_str()).collect();
                    self.set_health(
                        components::PIPELINE,
                        Some(format!("tasks on default output: {}", names.join(", "))),
                    )
                    .await;
                }
            }
            TickStatus::Skipped { reason } => {
                self.logger.log_tick_skipped(reason);
                self.set_health(components::PIPELINE, Some(format!("tick skipped: {}", reason)))
                    .await;
            }
            TickStatus::Failed { task, error } => {
                self.logger.log_tick_failed(task.as_str(), error);
                self.set_health(components::PIPELINE, Some(format!("{} task failed: {}", task, error)))
                    .await;
            }
        }

        debug!(trigger = trigger.as_str(), outcome = status.outcome(), duration_us, "Tick finished");
        TickReport {
            trigger,
            status,
            result,
            degraded,
            duration_us,
        }
    }

    async fn execute(&self) -> (TickStatus, Option<PredictionResult>, Vec<TaskKind>) {
        let readings = match self.source.fetch_latest(self.window_length).await {
            Ok(readings) => {
                self.set_health(components::SOURCE, None).await;
                readings
            }
            Err(e) => {
                let reason = format!("reading source error: {:#}", e);
                self.set_health(components::SOURCE, Some(reason.clone())).await;
                return (TickStatus::Skipped { reason }, None, Vec::new());
            }
        };

        let window = match FeatureWindow::with_length(readings, self.window_length) {
            Ok(window) => window,
            Err(e) => {
                let reason = TickError::from(e).to_string();
                return (TickStatus::Skipped { reason }, None, Vec::new());
            }
        };

        let outputs = match self.orchestrator.run(&window) {
            Ok(outputs) => outputs,
            Err(TickError::Task { task, source }) => {
                let status = TickStatus::Failed {
                    task,
                    error: source.to_string(),
                };
                return (status, None, Vec::new());
            }
            Err(e) => {
                return (TickStatus::Skipped { reason: e.to_string() }, None, Vec::new());
            }
        };

        for task in &outputs.degraded {
            self.metrics.inc_task_fallback(task.as_str());
        }
        if outputs.is_anomaly {
            self.metrics.inc_anomalies_detected();
        }

        let result = self.assembler.assemble(&outputs, window.latest());
        let stored = match self.sink.store(&result).await {
            Ok(()) => {
                self.set_health(components::SINK, None).await;
                true
            }
            Err(e) => {
                let error = format!("{:#}", e);
                self.metrics.inc_sink_errors();
                self.logger.log_store_failed(&result.device_id, &error);
                self.set_health(components::SINK, Some(error)).await;
                false
            }
        };

        (TickStatus::Completed { stored }, Some(result), outputs.degraded)
    }

    /// Healthy when `problem` is `None`, degraded otherwise
    async fn set_health(&self, component: &str, problem: Option<String>) {
        if let Some(health) = &self.health {
            match problem {
                None => health.set_healthy(component).await,
                Some(message) => health.set_degraded(component, message).await,
            }
        }
    }
}

/// Fires scheduled ticks at a fixed interval until shutdown
pub struct PredictionScheduler {
    pipeline: Arc<PredictionPipeline>,
    interval: Duration,
}

impl PredictionScheduler {
    pub fn new(pipeline: Arc<PredictionPipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting prediction scheduler");

        let mut ticker = interval(self.interval);
        // a long tick postpones the next one instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pipeline.run_tick(TickTrigger::Scheduled).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down prediction scheduler");
                    break;
                }
            }
        }
    }
}
