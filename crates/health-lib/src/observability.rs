//! Observability for the health predictor
//!
//! Provides:
//! - Prometheus metrics (tick latency, tick outcomes, task fallbacks, model origins)
//! - Structured JSON logging with tracing

use crate::models::PredictionResult;
use crate::registry::ModelRegistry;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec, Histogram,
    IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Tick latency buckets (in seconds)
const TICK_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PredictorMetricsInner> = OnceLock::new();

struct PredictorMetricsInner {
    tick_latency_seconds: Histogram,
    ticks_total: IntCounterVec,
    task_fallbacks_total: IntCounterVec,
    anomalies_detected: IntCounter,
    sink_errors: IntCounter,
    model_origin_info: IntGaugeVec,
}

impl PredictorMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "health_predictor_tick_latency_seconds",
                "Duration of one fetch, infer and store cycle",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            ticks_total: register_int_counter_vec!(
                "health_predictor_ticks_total",
                "Prediction ticks by outcome",
                &["outcome"]
            )
            .expect("Failed to register ticks_total"),

            task_fallbacks_total: register_int_counter_vec!(
                "health_predictor_task_fallbacks_total",
                "Tasks that answered with their default output",
                &["task"]
            )
            .expect("Failed to register task_fallbacks_total"),

            anomalies_detected: register_int_counter!(
                "health_predictor_anomalies_detected_total",
                "Predictions flagged as anomalous"
            )
            .expect("Failed to register anomalies_detected"),

            sink_errors: register_int_counter!(
                "health_predictor_sink_errors_total",
                "Predictions the result sink failed to store"
            )
            .expect("Failed to register sink_errors"),

            model_origin_info: register_int_gauge_vec!(
                "health_predictor_model_origin_info",
                "Origin of every loaded model (artifact, fallback or provided)",
                &["model", "origin"]
            )
            .expect("Failed to register model_origin_info"),
        }
    }
}

/// Lightweight handle to the global predictor metrics
#[derive(Clone)]
pub struct PredictorMetrics {
    _private: (),
}

impl Default for PredictorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PredictorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PredictorMetricsInner {
        GLOBAL_METRICS.get_or_init(PredictorMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    /// Count a tick under `outcome` (completed, skipped, failed)
    pub fn inc_tick(&self, outcome: &str) {
        self.inner().ticks_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_task_fallback(&self, task: &str) {
        self.inner().task_fallbacks_total.with_label_values(&[task]).inc();
    }

    pub fn inc_anomalies_detected(&self) {
        self.inner().anomalies_detected.inc();
    }

    pub fn inc_sink_errors(&self) {
        self.inner().sink_errors.inc();
    }

    /// Publish the origin of every registry slot
    pub fn set_model_origins(&self, registry: &ModelRegistry) {
        let gauge = &self.inner().model_origin_info;
        gauge.reset();
        for entry in registry.summary() {
            gauge
                .with_label_values(&[entry.model.as_str(), entry.origin.label()])
                .set(1);
        }
    }

    pub fn ticks(&self, outcome: &str) -> u64 {
        self.inner().ticks_total.with_label_values(&[outcome]).get()
    }
}

/// Structured logger for predictor events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, model_dir: &str, fallbacks: usize) {
        info!(
            event = "predictor_started",
            instance = %self.instance,
            version = %version,
            model_dir = %model_dir,
            fallbacks = fallbacks,
            "Health predictor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "predictor_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Health predictor shutting down"
        );
    }

    pub fn log_prediction(&self, result: &PredictionResult, stored: bool, duration_us: u64) {
        let log = |msg: &str| {
            info!(
                event = "prediction_generated",
                instance = %self.instance,
                device_id = %result.device_id,
                timestamp = %result.timestamp,
                is_anomaly = result.is_anomaly,
                failure_probability = result.failure_probability,
                health_index = result.health_index,
                remaining_useful_life = result.remaining_useful_life,
                part_at_risk = %result.part_at_risk,
                condition = %result.condition,
                stored = stored,
                duration_us = duration_us,
                "{}",
                msg
            )
        };
        if result.is_anomaly {
            log("Anomalous prediction generated");
        } else {
            log("Prediction generated");
        }
    }

    pub fn log_tick_skipped(&self, reason: &str) {
        info!(
            event = "tick_skipped",
            instance = %self.instance,
            reason = %reason,
            "Prediction tick skipped"
        );
    }

    pub fn log_tick_failed(&self, task: &str, error: &str) {
        warn!(
            event = "tick_failed",
            instance = %self.instance,
            task = %task,
            error = %error,
            "Prediction tick failed, nothing stored"
        );
    }

    pub fn log_store_failed(&self, device_id: &str, error: &str) {
        warn!(
            event = "prediction_store_failed",
            instance = %self.instance,
            device_id = %device_id,
            error = %error,
            "Failed to store prediction"
        );
    }
}
