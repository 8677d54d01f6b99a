//! Result assembly
//!
//! Maps the raw task outputs and the reading that triggered the tick into a
//! [`PredictionResult`]. Values are passed through unrounded.

use super::inference::InferenceOutputs;
use crate::models::{Condition, PartAtRisk, PredictionResult, SensorReading};

/// Part-risk class index to label, in training order
pub const PART_RISK_TABLE: [(PartAtRisk, Condition); 6] = [
    (PartAtRisk::Compressor, Condition::Warning),
    (PartAtRisk::Condenser, Condition::Warning),
    (PartAtRisk::Evaporator, Condition::Warning),
    (PartAtRisk::ExpansionValve, Condition::Warning),
    (PartAtRisk::FanMotor, Condition::Warning),
    (PartAtRisk::None, Condition::Normal),
];

/// Label for a part-risk class; unknown classes and fallbacks map to unknown/normal
pub fn part_for_class(class_index: Option<usize>) -> (PartAtRisk, Condition) {
    class_index
        .and_then(|i| PART_RISK_TABLE.get(i).copied())
        .unwrap_or((PartAtRisk::Unknown, Condition::Normal))
}

/// Builds the unified prediction from task outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAssembler;

impl ResultAssembler {
    pub fn new() -> Self {
        Self
    }

    pub fn assemble(&self, outputs: &InferenceOutputs, latest: &SensorReading) -> PredictionResult {
        let (part_at_risk, condition) = part_for_class(outputs.part_class);
        PredictionResult {
            device_id: latest.device_id.clone(),
            timestamp: latest.timestamp,
            is_anomaly: outputs.is_anomaly,
            failure_probability: outputs.failure_probability,
            health_index: outputs.health_index,
            remaining_useful_life: outputs.remaining_useful_life,
            part_at_risk,
            condition,
        }
    }
}
