//! Feature scaling statistics
//!
//! Two families are in use: mean/standard-deviation statistics for tree
//! inputs and min/max bounds for the networks. Sequence bounds are fixed at
//! training time; the part-risk bounds are fitted and shipped as an artifact.

use super::ModelError;
use crate::models::{FEATURE_NAMES, NUM_FEATURES, VIBRATION_MEAN_FEATURE};
use serde::{Deserialize, Serialize};

/// Lower training bounds of the sequence models, in reading order
pub const SEQUENCE_MIN: [f64; NUM_FEATURES] = [-5.0, -30.0, -10.0, 15.0, 20.0, 0.0, 0.0, 0.0, 0.0, 100.0, 0.0];

/// Upper training bounds of the sequence models, in reading order
pub const SEQUENCE_MAX: [f64; NUM_FEATURES] = [0.0, -15.0, 5.0, 35.0, 80.0, 10.0, 10.0, 10.0, 20.0, 240.0, 0.1];

/// Target range the RUL model was trained to predict in normalized form
pub const RUL_TARGET_MIN: f64 = 0.0;
pub const RUL_TARGET_MAX: f64 = 1000.0;

/// Smallest range a fitted scaler divides by
const MIN_RANGE: f64 = 1e-5;

/// Per-feature mean and standard deviation for tree-model inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub mean: [f64; NUM_FEATURES],
    pub std: [f64; NUM_FEATURES],
}

impl Default for NormalizationStats {
    fn default() -> Self {
        Self {
            mean: [0.0; NUM_FEATURES],
            std: [1.0; NUM_FEATURES],
        }
    }
}

impl NormalizationStats {
    /// `(raw - mean) / std` for every feature
    pub fn apply(&self, raw: &[f64; NUM_FEATURES]) -> [f64; NUM_FEATURES] {
        let mut out = [0.0; NUM_FEATURES];
        for (i, v) in out.iter_mut().enumerate() {
            *v = (raw[i] - self.mean[i]) / self.std[i];
        }
        out
    }
}

/// On-disk form of [`NormalizationStats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationArtifact {
    pub features: Vec<String>,
    pub mean: [f64; NUM_FEATURES],
    pub std: [f64; NUM_FEATURES],
}

impl NormalizationArtifact {
    pub fn into_stats(self) -> Result<NormalizationStats, ModelError> {
        check_feature_order(&self.features, &FEATURE_NAMES)?;
        if let Some(i) = self.std.iter().position(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ModelError::Malformed(format!(
                "standard deviation of '{}' must be positive, got {}",
                FEATURE_NAMES[i], self.std[i]
            )));
        }
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(ModelError::Malformed("mean contains non-finite values".to_string()));
        }
        Ok(NormalizationStats {
            mean: self.mean,
            std: self.std,
        })
    }
}

/// Min-max scaler: `(raw - min) / (max - min)`, no clamping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl MinMaxScaler {
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Result<Self, ModelError> {
        if min.len() != max.len() {
            return Err(ModelError::Malformed(format!(
                "scaler has {} minimums and {} maximums",
                min.len(),
                max.len()
            )));
        }
        if min.iter().chain(max.iter()).any(|v| !v.is_finite()) {
            return Err(ModelError::Malformed("scaler bounds must be finite".to_string()));
        }
        Ok(Self { min, max })
    }

    /// Bounds the sequence models were trained with
    pub fn sequence_bounds() -> Self {
        Self {
            min: SEQUENCE_MIN.to_vec(),
            max: SEQUENCE_MAX.to_vec(),
        }
    }

    pub fn width(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    /// Scale one value of column `index`
    pub fn scale(&self, index: usize, raw: f64) -> f64 {
        let range = self.max[index] - self.min[index];
        let range = if range.abs() < MIN_RANGE { MIN_RANGE } else { range };
        (raw - self.min[index]) / range
    }

    pub fn transform(&self, raw: &[f64]) -> Result<Vec<f64>, ModelError> {
        if raw.len() != self.width() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![self.width()],
                got: vec![raw.len()],
            });
        }
        Ok(raw.iter().enumerate().map(|(i, &v)| self.scale(i, v)).collect())
    }
}

/// On-disk form of the fitted part-risk scaler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerArtifact {
    pub features: Vec<String>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl ScalerArtifact {
    pub fn into_part_risk_scaler(self) -> Result<MinMaxScaler, ModelError> {
        let expected: Vec<&str> = FEATURE_NAMES
            .iter()
            .copied()
            .chain(std::iter::once(VIBRATION_MEAN_FEATURE))
            .collect();
        check_feature_order(&self.features, &expected)?;
        let scaler = MinMaxScaler::new(self.min, self.max)?;
        if scaler.width() != expected.len() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![expected.len()],
                got: vec![scaler.width()],
            });
        }
        Ok(scaler)
    }
}

fn check_feature_order(found: &[String], expected: &[&str]) -> Result<(), ModelError> {
    let matches = found.len() == expected.len() && found.iter().zip(expected).all(|(a, b)| a == b);
    if matches {
        Ok(())
    } else {
        Err(ModelError::Malformed(format!(
            "feature order {:?} does not match {:?}",
            found, expected
        )))
    }
}
