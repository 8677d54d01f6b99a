//! Data-store boundary
//!
//! The pipeline reads sensor readings from a [`ReadingSource`] and writes
//! predictions to a [`ResultSink`]. Two implementations ship with the crate:
//! an in-memory store and a PostgREST adapter for Supabase.

mod memory;
mod rest;

pub use memory::MemoryStore;
pub use rest::{parse_sensor_rows, parse_timestamp, prediction_payload, SupabaseConfig, SupabaseStore};

use crate::models::{PredictionResult, SensorReading};
use anyhow::Result;

pub use async_trait::async_trait;

/// Source of the most recent sensor readings
#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// Up to `limit` of the most recent readings, ascending by timestamp
    async fn fetch_latest(&self, limit: usize) -> Result<Vec<SensorReading>>;
}

/// Destination for assembled predictions
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, result: &PredictionResult) -> Result<()>;
}
