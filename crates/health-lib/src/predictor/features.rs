//! Feature preprocessing for the five prediction tasks
//!
//! Turns a validated [`FeatureWindow`] into the exact input each model was
//! trained on:
//! - sequence models: min-max scaled `[1, len, 11]` tensor with the fixed
//!   training bounds (out-of-range readings are not clamped)
//! - tree models: mean/std normalized features plus a missing target slot
//! - part-risk model: raw features plus mean vibration, min-max scaled with
//!   the fitted part-risk scaler

use super::inference::{InferenceError, TaskKind};
use crate::models::{FeatureWindow, SensorReading, NUM_FEATURES, PART_RISK_FEATURES};
use crate::registry::{FlatInstance, ModelError, ModelRegistry};
use std::sync::Arc;
use tract_onnx::prelude::tract_ndarray::{Array2, Array3, ArrayD};

/// Input of one task, tagged by the shape the model consumes
#[derive(Debug, Clone)]
pub enum ModelInput<'a> {
    /// Single scaled row `[1, 11]`
    Vector(ArrayD<f32>),
    /// Scaled sequence `[1, len, 11]`
    Sequence(ArrayD<f32>),
    /// Normalized tree-model instance
    Instance(FlatInstance<'a>),
    /// Scaled 12-feature part-risk vector `[1, 12]`
    PartRisk(ArrayD<f32>),
}

impl ModelInput<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelInput::Vector(_) => "vector",
            ModelInput::Sequence(_) => "sequence",
            ModelInput::Instance(_) => "instance",
            ModelInput::PartRisk(_) => "part_risk",
        }
    }
}

/// Builds model inputs from readings using the registry's statistics
#[derive(Clone)]
pub struct FeatureTransformer {
    registry: Arc<ModelRegistry>,
}

impl FeatureTransformer {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Min-max scale every reading with the sequence training bounds
    pub fn build_sequence(&self, readings: &[SensorReading]) -> ArrayD<f32> {
        let bounds = self.registry.sequence_bounds();
        let sequence = Array3::from_shape_fn((1, readings.len(), NUM_FEATURES), |(_, t, f)| {
            bounds.scale(f, readings[t].features[f]) as f32
        });
        sequence.into_dyn()
    }

    /// Normalized instance for the failure or health-index forest
    pub fn build_flat_instance(
        &self,
        reading: &SensorReading,
        task: TaskKind,
    ) -> Result<FlatInstance<'_>, InferenceError> {
        let forest = match task {
            TaskKind::FailureProbability => self.registry.failure_forest(),
            TaskKind::HealthIndex => self.registry.health_index_forest(),
            other => {
                return Err(InferenceError::InputKind {
                    task: other,
                    input: "instance",
                })
            }
        };
        let normalized = self.registry.normalization().apply(&reading.features);
        Ok(FlatInstance::new(forest.header(), &normalized))
    }

    /// Raw features plus mean vibration, scaled with the fitted part-risk scaler
    pub fn build_part_risk_instance(&self, reading: &SensorReading) -> Result<ArrayD<f32>, ModelError> {
        let scaler = self.registry.part_risk_scaler().ok_or(ModelError::ScalerNotFitted)?;

        let mut raw = Vec::with_capacity(PART_RISK_FEATURES);
        raw.extend_from_slice(&reading.features);
        raw.push(reading.vibration_mean());

        let scaled = scaler.transform(&raw)?;
        let row = Array2::from_shape_fn((1, PART_RISK_FEATURES), |(_, i)| scaled[i] as f32);
        Ok(row.into_dyn())
    }

    /// Build the input `task` consumes from `window`
    pub fn prepare(&self, task: TaskKind, window: &FeatureWindow) -> Result<ModelInput<'_>, InferenceError> {
        match task {
            TaskKind::Anomaly => {
                let latest = std::slice::from_ref(window.latest());
                let row = self
                    .build_sequence(latest)
                    .into_shape(vec![1, NUM_FEATURES])
                    .map_err(|e| ModelError::Runtime(e.into()))?;
                Ok(ModelInput::Vector(row))
            }
            TaskKind::RemainingUsefulLife => Ok(ModelInput::Sequence(self.build_sequence(window.readings()))),
            TaskKind::FailureProbability | TaskKind::HealthIndex => {
                Ok(ModelInput::Instance(self.build_flat_instance(window.latest(), task)?))
            }
            TaskKind::PartAtRisk => Ok(ModelInput::PartRisk(self.build_part_risk_instance(window.latest())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{readings, window, MIDPOINT_FEATURES};
    use crate::models::SEQUENCE_LENGTH;
    use crate::registry::scaler::{SEQUENCE_MAX, SEQUENCE_MIN};
    use crate::registry::{MinMaxScaler, NormalizationStats};

    fn transformer(registry: ModelRegistry) -> FeatureTransformer {
        FeatureTransformer::new(Arc::new(registry))
    }

    #[test]
    fn test_sequence_shape_and_values() {
        let t = transformer(ModelRegistry::fallback());
        let mut features = MIDPOINT_FEATURES;
        features[1] = -40.0; // below the training range
        features[9] = 260.0; // above the training range
        let input = readings("d1", SEQUENCE_LENGTH, features);

        let seq = t.build_sequence(&input);
        assert_eq!(seq.shape(), &[1, SEQUENCE_LENGTH, NUM_FEATURES]);
        for step in 0..SEQUENCE_LENGTH {
            for f in 0..NUM_FEATURES {
                let expected = (features[f] - SEQUENCE_MIN[f]) / (SEQUENCE_MAX[f] - SEQUENCE_MIN[f]);
                assert!((seq[[0, step, f]] as f64 - expected).abs() < 1e-6);
            }
        }
        assert!(seq[[0, 0, 1]] < 0.0);
        assert!(seq[[0, 0, 9]] > 1.0);
    }

    #[test]
    fn test_midpoint_readings_scale_to_half() {
        let t = transformer(ModelRegistry::fallback());
        let seq = t.build_sequence(window(MIDPOINT_FEATURES).readings());
        assert!(seq.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_flat_instance_uses_normalization() {
        let stats = NormalizationStats {
            mean: [1.0; NUM_FEATURES],
            std: [2.0; NUM_FEATURES],
        };
        let t = transformer(ModelRegistry::builder().normalization(stats).build());
        let w = window([5.0; NUM_FEATURES]);

        let instance = t.build_flat_instance(w.latest(), TaskKind::HealthIndex).unwrap();
        assert_eq!(instance.values().len(), NUM_FEATURES + 1);
        assert!(instance.values()[..NUM_FEATURES].iter().all(|&v| v == 2.0));
        assert!(instance.is_missing(instance.class_index()));
        assert_eq!(instance.header().relation, "health_index_data");

        assert!(matches!(
            t.build_flat_instance(w.latest(), TaskKind::RemainingUsefulLife),
            Err(InferenceError::InputKind { .. })
        ));
    }

    #[test]
    fn test_part_risk_instance_requires_fitted_scaler() {
        let t = transformer(ModelRegistry::fallback());
        let w = window(MIDPOINT_FEATURES);
        assert!(matches!(
            t.build_part_risk_instance(w.latest()),
            Err(ModelError::ScalerNotFitted)
        ));
    }

    #[test]
    fn test_part_risk_instance_appends_vibration_mean() {
        let scaler = MinMaxScaler::new(vec![0.0; 12], vec![10.0; 12]).unwrap();
        let t = transformer(ModelRegistry::builder().part_risk_scaler(scaler).build());
        let mut features = [0.0; NUM_FEATURES];
        features[5] = 3.0;
        features[6] = 6.0;
        features[7] = 9.0;
        let w = window(features);

        let input = t.build_part_risk_instance(w.latest()).unwrap();
        assert_eq!(input.shape(), &[1, PART_RISK_FEATURES]);
        assert!((input[[0, 11]] - 0.6).abs() < 1e-6);
        assert!((input[[0, 5]] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_tags_inputs() {
        let t = transformer(ModelRegistry::fallback());
        let w = window(MIDPOINT_FEATURES);

        match t.prepare(TaskKind::Anomaly, &w).unwrap() {
            ModelInput::Vector(v) => assert_eq!(v.shape(), &[1, NUM_FEATURES]),
            other => panic!("unexpected input {}", other.kind()),
        }
        match t.prepare(TaskKind::RemainingUsefulLife, &w).unwrap() {
            ModelInput::Sequence(s) => assert_eq!(s.shape(), &[1, SEQUENCE_LENGTH, NUM_FEATURES]),
            other => panic!("unexpected input {}", other.kind()),
        }
        assert!(matches!(
            t.prepare(TaskKind::FailureProbability, &w).unwrap(),
            ModelInput::Instance(_)
        ));
    }
}
