//! Equipment health prediction library
//!
//! This crate provides the core functionality for:
//! - Loading trained models with per-model fallbacks
//! - Preprocessing sensor windows into model inputs
//! - Orchestrating the anomaly, failure, health-index, RUL and part-risk models
//! - Reading sensor data from and storing predictions to the data store
//! - Health checks and observability

pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod registry;
pub mod store;

pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{PredictorMetrics, StructuredLogger};
pub use registry::{ModelError, ModelRegistry, ModelRegistryBuilder};
