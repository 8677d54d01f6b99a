//! Core data models for the health predictor

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of raw measurements in every sensor reading
pub const NUM_FEATURES: usize = 11;

/// Number of readings the sequence models were trained on
pub const SEQUENCE_LENGTH: usize = 11;

/// Width of the part-risk input (raw features plus mean vibration)
pub const PART_RISK_FEATURES: usize = NUM_FEATURES + 1;

/// Number of part-risk classes
pub const PART_RISK_CLASSES: usize = 6;

/// Canonical column order of a reading. Artifacts fitted on a different
/// order are rejected at load time.
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "evaporator_coil_temperature",
    "fridge_temperature",
    "freezer_temperature",
    "air_temperature",
    "humidity",
    "compressor_vibration_x",
    "compressor_vibration_y",
    "compressor_vibration_z",
    "compressor_current",
    "input_voltage",
    "gas_leakage_level",
];

/// Name of the derived 12th part-risk feature
pub const VIBRATION_MEAN_FEATURE: &str = "compressor_vibration_mean";

/// Indices of the three vibration axes inside a reading
pub const VIBRATION_AXES: [usize; 3] = [5, 6, 7];

/// A single reading from one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub timestamp: NaiveDateTime,
    pub features: [f64; NUM_FEATURES],
}

impl SensorReading {
    pub fn new(
        device_id: impl Into<String>,
        timestamp: NaiveDateTime,
        features: [f64; NUM_FEATURES],
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            features,
        }
    }

    /// Arithmetic mean of the three compressor vibration axes
    pub fn vibration_mean(&self) -> f64 {
        VIBRATION_AXES.iter().map(|&i| self.features[i]).sum::<f64>() / VIBRATION_AXES.len() as f64
    }
}

/// Reasons a set of readings cannot form a window
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("no sensor readings available")]
    Empty,
    #[error("window length must be at least one reading")]
    ZeroLength,
    #[error("insufficient readings: got {got}, need {need}")]
    Insufficient { got: usize, need: usize },
    #[error("window mixes devices {first} and {other}")]
    MixedDevices { first: String, other: String },
    #[error("readings are not strictly ascending at position {position}")]
    OutOfOrder { position: usize },
}

/// Fixed-length, strictly time-ordered readings of a single device
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    readings: Vec<SensorReading>,
}

impl FeatureWindow {
    /// Build a window of [`SEQUENCE_LENGTH`] readings. Longer inputs keep
    /// their trailing readings.
    pub fn new(readings: Vec<SensorReading>) -> Result<Self, WindowError> {
        Self::with_length(readings, SEQUENCE_LENGTH)
    }

    pub fn with_length(mut readings: Vec<SensorReading>, length: usize) -> Result<Self, WindowError> {
        if length == 0 {
            return Err(WindowError::ZeroLength);
        }
        if readings.is_empty() {
            return Err(WindowError::Empty);
        }
        if readings.len() < length {
            return Err(WindowError::Insufficient {
                got: readings.len(),
                need: length,
            });
        }
        if readings.len() > length {
            readings.drain(..readings.len() - length);
        }

        let first = &readings[0].device_id;
        if let Some(other) = readings.iter().find(|r| &r.device_id != first) {
            return Err(WindowError::MixedDevices {
                first: first.clone(),
                other: other.device_id.clone(),
            });
        }
        if let Some(position) = readings
            .windows(2)
            .position(|pair| pair[1].timestamp <= pair[0].timestamp)
        {
            return Err(WindowError::OutOfOrder { position: position + 1 });
        }

        Ok(Self { readings })
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    pub fn device_id(&self) -> &str {
        &self.readings[0].device_id
    }

    /// The reading that triggered this window (most recent)
    pub fn latest(&self) -> &SensorReading {
        &self.readings[self.readings.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Component predicted to be at risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartAtRisk {
    Compressor,
    Condenser,
    Evaporator,
    ExpansionValve,
    FanMotor,
    None,
    Unknown,
}

impl PartAtRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartAtRisk::Compressor => "compressor",
            PartAtRisk::Condenser => "condenser",
            PartAtRisk::Evaporator => "evaporator",
            PartAtRisk::ExpansionValve => "expansion_valve",
            PartAtRisk::FanMotor => "fan_motor",
            PartAtRisk::None => "none",
            PartAtRisk::Unknown => "unknown",
        }
    }

    /// True for labels naming an actual component
    pub fn is_component(&self) -> bool {
        !matches!(self, PartAtRisk::None | PartAtRisk::Unknown)
    }
}

impl fmt::Display for PartAtRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition tag attached to the part-at-risk label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Normal,
    Warning,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Normal => "normal",
            Condition::Warning => "warning",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified health prediction for one device at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub device_id: String,
    pub timestamp: NaiveDateTime,
    pub is_anomaly: bool,
    pub failure_probability: f64,
    pub health_index: f64,
    pub remaining_useful_life: f64,
    pub part_at_risk: PartAtRisk,
    pub condition: Condition,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::{Duration, NaiveDate};

    /// Midpoint of every training range used by the sequence models
    pub const MIDPOINT_FEATURES: [f64; NUM_FEATURES] =
        [-2.5, -22.5, -2.5, 25.0, 50.0, 5.0, 5.0, 5.0, 10.0, 170.0, 0.05];

    pub fn base_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    pub fn readings(device_id: &str, count: usize, features: [f64; NUM_FEATURES]) -> Vec<SensorReading> {
        (0..count)
            .map(|i| SensorReading::new(device_id, base_time() + Duration::seconds(i as i64 * 10), features))
            .collect()
    }

    pub fn window(features: [f64; NUM_FEATURES]) -> FeatureWindow {
        FeatureWindow::new(readings("fridge-01", SEQUENCE_LENGTH, features)).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_window_requires_full_length() {
        let err = FeatureWindow::new(readings("d1", 5, MIDPOINT_FEATURES)).unwrap_err();
        assert_eq!(err, WindowError::Insufficient { got: 5, need: SEQUENCE_LENGTH });
        assert_eq!(FeatureWindow::new(Vec::new()).unwrap_err(), WindowError::Empty);
    }

    #[test]
    fn test_window_rejects_zero_length() {
        let err = FeatureWindow::with_length(readings("d1", 3, MIDPOINT_FEATURES), 0).unwrap_err();
        assert_eq!(err, WindowError::ZeroLength);
    }

    #[test]
    fn test_window_keeps_trailing_readings() {
        let input = readings("d1", 15, MIDPOINT_FEATURES);
        let last = input.last().unwrap().timestamp;
        let window = FeatureWindow::new(input).unwrap();
        assert_eq!(window.len(), SEQUENCE_LENGTH);
        assert_eq!(window.latest().timestamp, last);
    }

    #[test]
    fn test_window_rejects_mixed_devices() {
        let mut input = readings("d1", SEQUENCE_LENGTH, MIDPOINT_FEATURES);
        input[3].device_id = "d2".to_string();
        assert!(matches!(
            FeatureWindow::new(input),
            Err(WindowError::MixedDevices { .. })
        ));
    }

    #[test]
    fn test_window_rejects_duplicate_timestamps() {
        let mut input = readings("d1", SEQUENCE_LENGTH, MIDPOINT_FEATURES);
        input[4].timestamp = input[3].timestamp;
        assert_eq!(
            FeatureWindow::new(input).unwrap_err(),
            WindowError::OutOfOrder { position: 4 }
        );
    }

    #[test]
    fn test_vibration_mean() {
        let mut features = [0.0; NUM_FEATURES];
        features[5] = 1.0;
        features[6] = 2.0;
        features[7] = 6.0;
        let reading = SensorReading::new("d1", base_time(), features);
        assert!((reading.vibration_mean() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_part_labels_serialize_snake_case() {
        let json = serde_json::to_string(&PartAtRisk::ExpansionValve).unwrap();
        assert_eq!(json, "\"expansion_valve\"");
        assert!(!PartAtRisk::Unknown.is_component());
        assert!(PartAtRisk::FanMotor.is_component());
    }
}
