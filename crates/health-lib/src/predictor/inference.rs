//! Inference orchestration
//!
//! Runs the five prediction tasks against the registry from a fixed
//! dispatch table. Every task produces an explicit [`TaskOutcome`]; the
//! task's [`FailurePolicy`] decides whether an error aborts the tick or is
//! replaced by a defined default.

use super::features::{FeatureTransformer, ModelInput};
use crate::models::{FeatureWindow, WindowError, NUM_FEATURES};
use crate::registry::scaler::{RUL_TARGET_MAX, RUL_TARGET_MIN};
use crate::registry::{ModelError, ModelRegistry, FAILURE_CLASS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Remaining useful life reported when the RUL model cannot run
pub const DEFAULT_RUL: f64 = 500.0;

/// One of the five prediction tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Anomaly,
    FailureProbability,
    HealthIndex,
    RemainingUsefulLife,
    PartAtRisk,
}

impl TaskKind {
    /// Dispatch order of a tick
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Anomaly,
        TaskKind::FailureProbability,
        TaskKind::HealthIndex,
        TaskKind::RemainingUsefulLife,
        TaskKind::PartAtRisk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Anomaly => "anomaly",
            TaskKind::FailureProbability => "failure_probability",
            TaskKind::HealthIndex => "health_index",
            TaskKind::RemainingUsefulLife => "remaining_useful_life",
            TaskKind::PartAtRisk => "part_at_risk",
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        match self {
            TaskKind::Anomaly | TaskKind::FailureProbability | TaskKind::HealthIndex => FailurePolicy::AbortTick,
            TaskKind::RemainingUsefulLife => FailurePolicy::UseDefault(RawOutput::RemainingUsefulLife(DEFAULT_RUL)),
            TaskKind::PartAtRisk => FailurePolicy::UseDefault(RawOutput::PartAtRisk { class_index: None }),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a task errors
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePolicy {
    /// The whole tick is abandoned, nothing is stored
    AbortTick,
    /// The given output is used instead
    UseDefault(RawOutput),
}

/// Raw value produced by one task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawOutput {
    Anomaly { reconstruction_error: f64, is_anomaly: bool },
    FailureProbability(f64),
    HealthIndex(f64),
    RemainingUsefulLife(f64),
    /// Arg-max class of the part-risk model, `None` when no trained model answered
    PartAtRisk { class_index: Option<usize> },
}

/// Result of running one task
#[derive(Debug)]
pub enum TaskOutcome {
    Success(RawOutput),
    Fallback { output: RawOutput, reason: String },
    Failed(InferenceError),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("task {task} cannot consume a {input} input")]
    InputKind { task: TaskKind, input: &'static str },

    #[error("model produced a non-finite value")]
    NonFinite,

    #[error("part-risk model is not trained")]
    PartRiskUntrained,
}

/// Why a tick produced no result
#[derive(Debug, Error)]
pub enum TickError {
    #[error("insufficient input: {0}")]
    Window(#[from] WindowError),

    #[error("{task} task failed: {source}")]
    Task {
        task: TaskKind,
        #[source]
        source: InferenceError,
    },
}

/// Outputs of all five tasks for one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceOutputs {
    pub is_anomaly: bool,
    pub reconstruction_error: f64,
    pub failure_probability: f64,
    pub health_index: f64,
    pub remaining_useful_life: f64,
    pub part_class: Option<usize>,
    /// Tasks that answered with their default
    pub degraded: Vec<TaskKind>,
}

/// Runs every task for a window against the registry
pub struct InferenceOrchestrator {
    registry: Arc<ModelRegistry>,
    transformer: FeatureTransformer,
}

impl InferenceOrchestrator {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        let transformer = FeatureTransformer::new(registry.clone());
        Self { registry, transformer }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn transformer(&self) -> &FeatureTransformer {
        &self.transformer
    }

    /// Run the full dispatch table; the first failed task aborts
    pub fn run(&self, window: &FeatureWindow) -> Result<InferenceOutputs, TickError> {
        let mut outputs = InferenceOutputs {
            is_anomaly: false,
            reconstruction_error: 0.0,
            failure_probability: 0.0,
            health_index: 0.0,
            remaining_useful_life: DEFAULT_RUL,
            part_class: None,
            degraded: Vec::new(),
        };

        for task in TaskKind::ALL {
            let output = match self.run_task(task, window) {
                TaskOutcome::Success(output) => output,
                TaskOutcome::Fallback { output, reason } => {
                    warn!(
                        event = "task_fallback",
                        task = %task,
                        device_id = %window.device_id(),
                        reason = %reason,
                        "Task used its default output"
                    );
                    outputs.degraded.push(task);
                    output
                }
                TaskOutcome::Failed(source) => return Err(TickError::Task { task, source }),
            };

            match output {
                RawOutput::Anomaly {
                    reconstruction_error,
                    is_anomaly,
                } => {
                    outputs.reconstruction_error = reconstruction_error;
                    outputs.is_anomaly = is_anomaly;
                }
                RawOutput::FailureProbability(p) => outputs.failure_probability = p,
                RawOutput::HealthIndex(h) => outputs.health_index = h,
                RawOutput::RemainingUsefulLife(r) => outputs.remaining_useful_life = r,
                RawOutput::PartAtRisk { class_index } => outputs.part_class = class_index,
            }
        }

        Ok(outputs)
    }

    /// Run one task and apply its failure policy
    pub fn run_task(&self, task: TaskKind, window: &FeatureWindow) -> TaskOutcome {
        let result = self.evaluate_task(task, window);
        match (result, task.policy()) {
            (Ok(output), _) => TaskOutcome::Success(output),
            (Err(e), FailurePolicy::AbortTick) => TaskOutcome::Failed(e),
            (Err(e), FailurePolicy::UseDefault(output)) => TaskOutcome::Fallback {
                output,
                reason: e.to_string(),
            },
        }
    }

    fn evaluate_task(&self, task: TaskKind, window: &FeatureWindow) -> Result<RawOutput, InferenceError> {
        // an untrained part-risk network would answer with noise
        if task == TaskKind::PartAtRisk && !self.registry.is_part_risk_trained() {
            return Err(InferenceError::PartRiskUntrained);
        }
        let input = self.transformer.prepare(task, window)?;
        self.evaluate(task, input)
    }

    fn evaluate(&self, task: TaskKind, input: ModelInput<'_>) -> Result<RawOutput, InferenceError> {
        match (task, input) {
            (TaskKind::Anomaly, ModelInput::Vector(row)) => {
                let original: Vec<f32> = row.iter().copied().collect();
                let reconstructed = self.registry.autoencoder().predict(row)?;
                let mse = reconstruction_error(&original, &reconstructed);
                if !mse.is_finite() {
                    return Err(InferenceError::NonFinite);
                }
                let threshold = self.registry.threshold();
                debug!(task = %task, mse = mse, threshold = threshold, "Reconstruction error computed");
                Ok(RawOutput::Anomaly {
                    reconstruction_error: mse,
                    is_anomaly: mse > threshold,
                })
            }
            (TaskKind::FailureProbability, ModelInput::Instance(instance)) => {
                let p = self.registry.failure_forest().class_probability(&instance, FAILURE_CLASS)?;
                finite(p).map(RawOutput::FailureProbability)
            }
            (TaskKind::HealthIndex, ModelInput::Instance(instance)) => {
                let h = self.registry.health_index_forest().classify(&instance)?;
                finite(h).map(RawOutput::HealthIndex)
            }
            (TaskKind::RemainingUsefulLife, ModelInput::Sequence(sequence)) => {
                let output = self.registry.rul().predict(sequence)?;
                let normalized = f64::from(output[0]);
                finite(normalized * (RUL_TARGET_MAX - RUL_TARGET_MIN) + RUL_TARGET_MIN)
                    .map(RawOutput::RemainingUsefulLife)
            }
            (TaskKind::PartAtRisk, ModelInput::PartRisk(vector)) => {
                let scores = self.registry.part_risk().predict(vector)?;
                if scores.iter().any(|s| !s.is_finite()) {
                    return Err(InferenceError::NonFinite);
                }
                Ok(RawOutput::PartAtRisk {
                    class_index: arg_max(&scores),
                })
            }
            (task, input) => Err(InferenceError::InputKind {
                task,
                input: input.kind(),
            }),
        }
    }
}

/// Mean squared difference over the feature columns
pub fn reconstruction_error(original: &[f32], reconstructed: &[f32]) -> f64 {
    let sum: f64 = original
        .iter()
        .zip(reconstructed)
        .map(|(&x, &r)| {
            let d = f64::from(x) - f64::from(r);
            d * d
        })
        .sum();
    sum / NUM_FEATURES as f64
}

fn arg_max(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
}

fn finite(value: f64) -> Result<f64, InferenceError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(InferenceError::NonFinite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{readings, window, MIDPOINT_FEATURES};
    use crate::models::{PART_RISK_CLASSES, PART_RISK_FEATURES, SEQUENCE_LENGTH};
    use crate::registry::forest::fixtures::{failure_forest, health_forest};
    use crate::registry::testing::{FailingModel, FixedOutputModel, IdentityModel};
    use crate::registry::{MinMaxScaler, ModelRegistryBuilder};

    fn trained() -> ModelRegistryBuilder {
        ModelRegistry::builder()
            .failure_forest(failure_forest())
            .health_index_forest(health_forest())
    }

    fn orchestrator(builder: ModelRegistryBuilder) -> InferenceOrchestrator {
        InferenceOrchestrator::new(Arc::new(builder.build()))
    }

    fn fitted_scaler() -> MinMaxScaler {
        MinMaxScaler::new(vec![0.0; PART_RISK_FEATURES], vec![1.0; PART_RISK_FEATURES]).unwrap()
    }

    fn one_hot(index: usize) -> Vec<f32> {
        let mut scores = vec![0.0; PART_RISK_CLASSES];
        scores[index] = 1.0;
        scores
    }

    #[test]
    fn test_policies() {
        assert_eq!(TaskKind::Anomaly.policy(), FailurePolicy::AbortTick);
        assert_eq!(TaskKind::FailureProbability.policy(), FailurePolicy::AbortTick);
        assert_eq!(TaskKind::HealthIndex.policy(), FailurePolicy::AbortTick);
        assert_eq!(
            TaskKind::RemainingUsefulLife.policy(),
            FailurePolicy::UseDefault(RawOutput::RemainingUsefulLife(500.0))
        );
    }

    #[test]
    fn test_full_run_with_trained_forests() {
        let o = orchestrator(trained());
        let outputs = o.run(&window(MIDPOINT_FEATURES)).unwrap();

        assert!((0.0..=1.0).contains(&outputs.failure_probability));
        assert!(outputs.health_index > 0.0);
        // fallback part-risk model is never consulted
        assert_eq!(outputs.part_class, None);
        assert_eq!(outputs.degraded, vec![TaskKind::PartAtRisk]);
    }

    #[test]
    fn test_anomaly_is_deterministic() {
        let o = orchestrator(trained());
        let w = window(MIDPOINT_FEATURES);
        let first = o.run_task(TaskKind::Anomaly, &w);
        let second = o.run_task(TaskKind::Anomaly, &w);
        match (first, second) {
            (TaskOutcome::Success(a), TaskOutcome::Success(b)) => assert_eq!(a, b),
            other => panic!("anomaly task did not succeed: {:?}", other),
        }
    }

    #[test]
    fn test_anomaly_threshold_comparison() {
        // identity reconstruction: zero error, never above the threshold
        let o = orchestrator(trained().threshold(0.0).autoencoder(IdentityModel {
            shape: vec![1, NUM_FEATURES],
        }));
        let outputs = o.run(&window(MIDPOINT_FEATURES)).unwrap();
        assert_eq!(outputs.reconstruction_error, 0.0);
        assert!(!outputs.is_anomaly);

        // reconstruction of all zeros against a 0.5 row: mse 0.25
        let o = orchestrator(
            trained()
                .threshold(0.2)
                .autoencoder(FixedOutputModel::new(&[1, NUM_FEATURES], vec![0.0; NUM_FEATURES])),
        );
        let outputs = o.run(&window(MIDPOINT_FEATURES)).unwrap();
        assert!((outputs.reconstruction_error - 0.25).abs() < 1e-6);
        assert!(outputs.is_anomaly);
    }

    #[test]
    fn test_rul_defaults_when_model_errors() {
        let o = orchestrator(trained().rul(FailingModel {
            shape: vec![1, SEQUENCE_LENGTH, NUM_FEATURES],
            output_len: 1,
        }));
        let outputs = o.run(&window(MIDPOINT_FEATURES)).unwrap();
        assert_eq!(outputs.remaining_useful_life, 500.0);
        assert!(outputs.degraded.contains(&TaskKind::RemainingUsefulLife));
    }

    #[test]
    fn test_rul_defaults_on_short_sequence() {
        let o = orchestrator(trained());
        let short = FeatureWindow::with_length(readings("d1", 8, MIDPOINT_FEATURES), 8).unwrap();
        match o.run_task(TaskKind::RemainingUsefulLife, &short) {
            TaskOutcome::Fallback { output, reason } => {
                assert_eq!(output, RawOutput::RemainingUsefulLife(500.0));
                assert!(reason.contains("shape"));
            }
            other => panic!("expected fallback, got {:?}", other),
        }
    }

    #[test]
    fn test_rul_is_denormalized() {
        let o = orchestrator(trained().rul(FixedOutputModel::new(&[1, SEQUENCE_LENGTH, NUM_FEATURES], vec![0.25])));
        let outputs = o.run(&window(MIDPOINT_FEATURES)).unwrap();
        assert!((outputs.remaining_useful_life - 250.0).abs() < 1e-9);
        assert_eq!(outputs.degraded, vec![TaskKind::PartAtRisk]);
    }

    #[test]
    fn test_part_risk_uses_trained_model() {
        let o = orchestrator(
            trained()
                .part_risk_scaler(fitted_scaler())
                .part_risk(FixedOutputModel::new(&[1, PART_RISK_FEATURES], one_hot(3))),
        );
        let outputs = o.run(&window(MIDPOINT_FEATURES)).unwrap();
        assert_eq!(outputs.part_class, Some(3));
        assert!(outputs.degraded.is_empty());
    }

    #[test]
    fn test_part_risk_without_scaler_falls_back() {
        let o = orchestrator(trained().part_risk(FixedOutputModel::new(&[1, PART_RISK_FEATURES], one_hot(0))));
        match o.run_task(TaskKind::PartAtRisk, &window(MIDPOINT_FEATURES)) {
            TaskOutcome::Fallback { output, .. } => {
                assert_eq!(output, RawOutput::PartAtRisk { class_index: None })
            }
            other => panic!("expected fallback, got {:?}", other),
        }
    }

    #[test]
    fn test_untrained_failure_forest_aborts() {
        let o = orchestrator(ModelRegistry::builder().health_index_forest(health_forest()));
        let err = o.run(&window(MIDPOINT_FEATURES)).unwrap_err();
        match err {
            TickError::Task { task, source } => {
                assert_eq!(task, TaskKind::FailureProbability);
                assert!(matches!(source, InferenceError::Model(ModelError::Untrained(_))));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_failing_autoencoder_aborts_first() {
        let o = orchestrator(trained().autoencoder(FailingModel {
            shape: vec![1, NUM_FEATURES],
            output_len: NUM_FEATURES,
        }));
        assert!(matches!(
            o.run(&window(MIDPOINT_FEATURES)),
            Err(TickError::Task {
                task: TaskKind::Anomaly,
                ..
            })
        ));
    }

    #[test]
    fn test_arg_max_prefers_first_maximum() {
        assert_eq!(arg_max(&[0.1, 0.7, 0.7, 0.2]), Some(1));
        assert_eq!(arg_max(&[]), None);
    }
}
