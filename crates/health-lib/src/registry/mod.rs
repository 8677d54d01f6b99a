//! Model registry
//!
//! Loads every trained artifact from a directory exactly once. Each slot is
//! loaded independently: a missing or unusable artifact is replaced by a
//! shape-compatible fallback so the registry always hands out a usable model.
//! The registry is immutable after construction and shared behind an `Arc`.

pub mod forest;
pub mod network;
pub mod onnx;
pub mod scaler;

pub use forest::{DecisionTree, FlatInstance, InstanceHeader, TargetAttribute, TreeEnsemble, TreeNode, FAILURE_CLASS};
pub use network::{Activation, DenseLayer, Layer, LstmLayer, NativeNetwork, NeuralModel};
pub use onnx::OnnxModel;
pub use scaler::{MinMaxScaler, NormalizationArtifact, NormalizationStats, ScalerArtifact};

use crate::models::{NUM_FEATURES, PART_RISK_CLASSES, PART_RISK_FEATURES, SEQUENCE_LENGTH};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const AUTOENCODER_FILE: &str = "autoencoder.onnx";
pub const RUL_FILE: &str = "rul.onnx";
pub const PART_RISK_FILE: &str = "part_risk.onnx";
pub const PART_RISK_SCALER_FILE: &str = "part_risk_scaler.json";
pub const FAILURE_FOREST_FILE: &str = "rf_failure.json";
pub const HEALTH_INDEX_FOREST_FILE: &str = "rf_health_index.json";
pub const THRESHOLD_FILE: &str = "threshold.json";
pub const NORMALIZATION_FILE: &str = "normalization.json";

/// Reconstruction-error threshold used when none was shipped
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Errors raised while evaluating a model
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("input shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("output size mismatch: expected {expected}, got {got}")]
    OutputSize { expected: usize, got: usize },

    #[error("model '{0}' has not been trained")]
    Untrained(String),

    #[error("part-risk scaler has not been fitted")]
    ScalerNotFitted,

    #[error("malformed model: {0}")]
    Malformed(String),

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Where the model in a slot came from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ModelOrigin {
    /// Loaded and validated from the artifact directory
    Artifact { path: PathBuf, sha256: String },
    /// Default installed because no usable artifact was found
    Fallback { reason: String },
    /// Injected explicitly through the builder
    Provided,
}

impl ModelOrigin {
    pub fn is_fallback(&self) -> bool {
        matches!(self, ModelOrigin::Fallback { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelOrigin::Artifact { .. } => "artifact",
            ModelOrigin::Fallback { .. } => "fallback",
            ModelOrigin::Provided => "provided",
        }
    }
}

/// A model together with its origin
#[derive(Debug, Clone)]
pub struct ModelSlot<T> {
    pub model: T,
    pub origin: ModelOrigin,
}

impl<T> ModelSlot<T> {
    fn provided(model: T) -> Self {
        Self {
            model,
            origin: ModelOrigin::Provided,
        }
    }

    fn fallback(model: T, reason: impl Into<String>) -> Self {
        Self {
            model,
            origin: ModelOrigin::Fallback { reason: reason.into() },
        }
    }
}

/// Identifies one slot of the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Autoencoder,
    Rul,
    PartRisk,
    PartRiskScaler,
    FailureForest,
    HealthIndexForest,
    Threshold,
    Normalization,
}

impl ModelKind {
    pub const ALL: [ModelKind; 8] = [
        ModelKind::Autoencoder,
        ModelKind::Rul,
        ModelKind::PartRisk,
        ModelKind::PartRiskScaler,
        ModelKind::FailureForest,
        ModelKind::HealthIndexForest,
        ModelKind::Threshold,
        ModelKind::Normalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Autoencoder => "autoencoder",
            ModelKind::Rul => "rul",
            ModelKind::PartRisk => "part_risk",
            ModelKind::PartRiskScaler => "part_risk_scaler",
            ModelKind::FailureForest => "failure_forest",
            ModelKind::HealthIndexForest => "health_index_forest",
            ModelKind::Threshold => "threshold",
            ModelKind::Normalization => "normalization",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ModelKind::Autoencoder => AUTOENCODER_FILE,
            ModelKind::Rul => RUL_FILE,
            ModelKind::PartRisk => PART_RISK_FILE,
            ModelKind::PartRiskScaler => PART_RISK_SCALER_FILE,
            ModelKind::FailureForest => FAILURE_FOREST_FILE,
            ModelKind::HealthIndexForest => HEALTH_INDEX_FOREST_FILE,
            ModelKind::Threshold => THRESHOLD_FILE,
            ModelKind::Normalization => NORMALIZATION_FILE,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator needs for one prediction
pub struct ModelBundle {
    pub autoencoder: ModelSlot<Box<dyn NeuralModel>>,
    pub rul: ModelSlot<Box<dyn NeuralModel>>,
    pub part_risk: ModelSlot<Box<dyn NeuralModel>>,
    pub part_risk_scaler: ModelSlot<Option<MinMaxScaler>>,
    pub failure: ModelSlot<TreeEnsemble>,
    pub health_index: ModelSlot<TreeEnsemble>,
    pub threshold: ModelSlot<f64>,
    pub normalization: ModelSlot<NormalizationStats>,
    /// Fixed training bounds of the sequence models
    pub sequence_bounds: MinMaxScaler,
}

/// Per-slot entry of [`ModelRegistry::summary`]
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub model: ModelKind,
    #[serde(flatten)]
    pub origin: ModelOrigin,
}

#[derive(Deserialize)]
struct ThresholdArtifact {
    threshold: f64,
}

/// Read-only access to the best available models
pub struct ModelRegistry {
    bundle: ModelBundle,
}

impl ModelRegistry {
    /// Load every artifact found in `dir`, falling back per slot
    pub fn load(dir: impl AsRef<Path>) -> Self {
        ModelRegistryBuilder::new().artifact_dir(dir).build()
    }

    /// A registry made entirely of fallbacks
    pub fn fallback() -> Self {
        ModelRegistryBuilder::new().build()
    }

    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::new()
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    pub fn autoencoder(&self) -> &dyn NeuralModel {
        self.bundle.autoencoder.model.as_ref()
    }

    pub fn rul(&self) -> &dyn NeuralModel {
        self.bundle.rul.model.as_ref()
    }

    pub fn part_risk(&self) -> &dyn NeuralModel {
        self.bundle.part_risk.model.as_ref()
    }

    pub fn part_risk_scaler(&self) -> Option<&MinMaxScaler> {
        self.bundle.part_risk_scaler.model.as_ref()
    }

    pub fn failure_forest(&self) -> &TreeEnsemble {
        &self.bundle.failure.model
    }

    pub fn health_index_forest(&self) -> &TreeEnsemble {
        &self.bundle.health_index.model
    }

    pub fn threshold(&self) -> f64 {
        self.bundle.threshold.model
    }

    pub fn normalization(&self) -> &NormalizationStats {
        &self.bundle.normalization.model
    }

    pub fn sequence_bounds(&self) -> &MinMaxScaler {
        &self.bundle.sequence_bounds
    }

    pub fn origin(&self, kind: ModelKind) -> &ModelOrigin {
        match kind {
            ModelKind::Autoencoder => &self.bundle.autoencoder.origin,
            ModelKind::Rul => &self.bundle.rul.origin,
            ModelKind::PartRisk => &self.bundle.part_risk.origin,
            ModelKind::PartRiskScaler => &self.bundle.part_risk_scaler.origin,
            ModelKind::FailureForest => &self.bundle.failure.origin,
            ModelKind::HealthIndexForest => &self.bundle.health_index.origin,
            ModelKind::Threshold => &self.bundle.threshold.origin,
            ModelKind::Normalization => &self.bundle.normalization.origin,
        }
    }

    /// True when the part-risk network is a trained model
    pub fn is_part_risk_trained(&self) -> bool {
        !self.bundle.part_risk.origin.is_fallback()
    }

    pub fn summary(&self) -> Vec<ModelSummary> {
        ModelKind::ALL
            .iter()
            .map(|&kind| ModelSummary {
                model: kind,
                origin: self.origin(kind).clone(),
            })
            .collect()
    }

    /// Number of slots running on a fallback
    pub fn fallback_count(&self) -> usize {
        ModelKind::ALL
            .iter()
            .filter(|&&kind| self.origin(kind).is_fallback())
            .count()
    }
}

/// Builds a [`ModelRegistry`], optionally with explicitly provided models
///
/// Provided models take precedence over artifacts, artifacts over fallbacks.
#[derive(Default)]
pub struct ModelRegistryBuilder {
    artifact_dir: Option<PathBuf>,
    autoencoder: Option<Box<dyn NeuralModel>>,
    rul: Option<Box<dyn NeuralModel>>,
    part_risk: Option<Box<dyn NeuralModel>>,
    part_risk_scaler: Option<MinMaxScaler>,
    failure: Option<TreeEnsemble>,
    health_index: Option<TreeEnsemble>,
    threshold: Option<f64>,
    normalization: Option<NormalizationStats>,
}

impl ModelRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifact_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.artifact_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn autoencoder(mut self, model: impl NeuralModel + 'static) -> Self {
        self.autoencoder = Some(Box::new(model));
        self
    }

    pub fn rul(mut self, model: impl NeuralModel + 'static) -> Self {
        self.rul = Some(Box::new(model));
        self
    }

    pub fn part_risk(mut self, model: impl NeuralModel + 'static) -> Self {
        self.part_risk = Some(Box::new(model));
        self
    }

    pub fn part_risk_scaler(mut self, scaler: MinMaxScaler) -> Self {
        self.part_risk_scaler = Some(scaler);
        self
    }

    pub fn failure_forest(mut self, forest: TreeEnsemble) -> Self {
        self.failure = Some(forest);
        self
    }

    pub fn health_index_forest(mut self, forest: TreeEnsemble) -> Self {
        self.health_index = Some(forest);
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn normalization(mut self, stats: NormalizationStats) -> Self {
        self.normalization = Some(stats);
        self
    }

    pub fn build(self) -> ModelRegistry {
        let dir = self.artifact_dir.as_deref();

        let autoencoder = match self.autoencoder {
            Some(model) => ModelSlot::provided(model),
            None => load_slot(dir, ModelKind::Autoencoder, load_onnx(&[1, NUM_FEATURES], NUM_FEATURES), || {
                Box::new(NativeNetwork::fallback_autoencoder(NUM_FEATURES)) as Box<dyn NeuralModel>
            }),
        };

        let rul = match self.rul {
            Some(model) => ModelSlot::provided(model),
            None => load_slot(dir, ModelKind::Rul, load_onnx(&[1, SEQUENCE_LENGTH, NUM_FEATURES], 1), || {
                Box::new(NativeNetwork::fallback_rul(SEQUENCE_LENGTH, NUM_FEATURES)) as Box<dyn NeuralModel>
            }),
        };

        let part_risk = match self.part_risk {
            Some(model) => ModelSlot::provided(model),
            None => load_slot(
                dir,
                ModelKind::PartRisk,
                load_onnx(&[1, PART_RISK_FEATURES], PART_RISK_CLASSES),
                || {
                    Box::new(NativeNetwork::fallback_part_risk(PART_RISK_FEATURES, PART_RISK_CLASSES))
                        as Box<dyn NeuralModel>
                },
            ),
        };

        let part_risk_scaler = match self.part_risk_scaler {
            Some(scaler) => ModelSlot::provided(Some(scaler)),
            None => load_slot(
                dir,
                ModelKind::PartRiskScaler,
                |_, bytes| {
                    let artifact: ScalerArtifact = serde_json::from_slice(bytes).context("Invalid scaler JSON")?;
                    Ok(Some(artifact.into_part_risk_scaler()?))
                },
                || None,
            ),
        };

        let failure = match self.failure {
            Some(forest) => ModelSlot::provided(forest),
            None => load_slot(dir, ModelKind::FailureForest, load_failure_forest, || {
                TreeEnsemble::untrained(InstanceHeader::failure_default())
            }),
        };

        let health_index = match self.health_index {
            Some(forest) => ModelSlot::provided(forest),
            None => load_slot(dir, ModelKind::HealthIndexForest, load_health_index_forest, || {
                TreeEnsemble::untrained(InstanceHeader::health_index_default())
            }),
        };

        let threshold = match self.threshold {
            Some(threshold) => ModelSlot::provided(threshold),
            None => load_slot(
                dir,
                ModelKind::Threshold,
                |_, bytes| {
                    let artifact: ThresholdArtifact =
                        serde_json::from_slice(bytes).context("Invalid threshold JSON")?;
                    if !artifact.threshold.is_finite() || artifact.threshold < 0.0 {
                        bail!("threshold must be a non-negative number, got {}", artifact.threshold);
                    }
                    Ok(artifact.threshold)
                },
                || DEFAULT_THRESHOLD,
            ),
        };

        let normalization = match self.normalization {
            Some(stats) => ModelSlot::provided(stats),
            None => load_slot(
                dir,
                ModelKind::Normalization,
                |_, bytes| {
                    let artifact: NormalizationArtifact =
                        serde_json::from_slice(bytes).context("Invalid normalization JSON")?;
                    Ok(artifact.into_stats()?)
                },
                NormalizationStats::default,
            ),
        };

        let registry = ModelRegistry {
            bundle: ModelBundle {
                autoencoder,
                rul,
                part_risk,
                part_risk_scaler,
                failure,
                health_index,
                threshold,
                normalization,
                sequence_bounds: MinMaxScaler::sequence_bounds(),
            },
        };

        info!(
            event = "model_registry_ready",
            fallbacks = registry.fallback_count(),
            threshold = registry.threshold(),
            "Model registry initialized"
        );
        registry
    }
}

fn load_onnx(
    input_shape: &'static [usize],
    output_len: usize,
) -> impl FnOnce(ModelKind, &[u8]) -> anyhow::Result<Box<dyn NeuralModel>> {
    move |kind, bytes| {
        let model = OnnxModel::from_bytes(kind.as_str(), bytes, input_shape, output_len)?;
        Ok(Box::new(model) as Box<dyn NeuralModel>)
    }
}

fn load_failure_forest(_: ModelKind, bytes: &[u8]) -> anyhow::Result<TreeEnsemble> {
    let forest: TreeEnsemble = serde_json::from_slice(bytes).context("Invalid forest JSON")?;
    forest.validate()?;
    match &forest.header().target {
        TargetAttribute::Nominal { values, .. } if values.iter().any(|v| v == FAILURE_CLASS) => Ok(forest),
        other => bail!("failure forest needs a nominal target with class '{}', got {:?}", FAILURE_CLASS, other),
    }
}

fn load_health_index_forest(_: ModelKind, bytes: &[u8]) -> anyhow::Result<TreeEnsemble> {
    let forest: TreeEnsemble = serde_json::from_slice(bytes).context("Invalid forest JSON")?;
    forest.validate()?;
    match &forest.header().target {
        TargetAttribute::Numeric { .. } => Ok(forest),
        other => bail!("health index forest needs a numeric target, got {:?}", other),
    }
}

/// Try the artifact for `kind`; install the fallback on any failure
fn load_slot<T>(
    dir: Option<&Path>,
    kind: ModelKind,
    parse: impl FnOnce(ModelKind, &[u8]) -> anyhow::Result<T>,
    fallback: impl FnOnce() -> T,
) -> ModelSlot<T> {
    let Some(dir) = dir else {
        return install_fallback(kind, fallback(), "no artifact directory configured".to_string());
    };

    let path = dir.join(kind.file_name());
    if !path.exists() {
        return install_fallback(kind, fallback(), format!("{} not found", path.display()));
    }

    let loaded = std::fs::read(&path)
        .with_context(|| format!("Failed to read {}", path.display()))
        .and_then(|bytes| {
            let sha256 = compute_checksum(&bytes);
            parse(kind, &bytes).map(|model| (model, sha256))
        });

    match loaded {
        Ok((model, sha256)) => {
            info!(
                event = "model_loaded",
                model = %kind,
                path = %path.display(),
                sha256 = %sha256,
                "Loaded model artifact"
            );
            ModelSlot {
                model,
                origin: ModelOrigin::Artifact { path, sha256 },
            }
        }
        Err(e) => install_fallback(kind, fallback(), format!("{:#}", e)),
    }
}

fn install_fallback<T>(kind: ModelKind, model: T, reason: String) -> ModelSlot<T> {
    warn!(
        event = "model_fallback_installed",
        model = %kind,
        reason = %reason,
        "Model artifact unavailable, using fallback"
    );
    ModelSlot::fallback(model, reason)
}

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
