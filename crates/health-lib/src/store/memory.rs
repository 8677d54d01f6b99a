//! In-memory reading queue and recording sink

use super::{async_trait, ReadingSource, ResultSink};
use crate::models::{PredictionResult, SensorReading};
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Queue-backed source and recording sink
///
/// Used when no data store is configured and as a test double.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: RwLock<Vec<SensorReading>>,
    stored: RwLock<Vec<PredictionResult>>,
    store_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_store: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(readings: Vec<SensorReading>) -> Self {
        Self {
            readings: RwLock::new(readings),
            ..Default::default()
        }
    }

    /// Append readings; callers push them in ascending time order
    pub async fn push_readings(&self, readings: impl IntoIterator<Item = SensorReading>) {
        self.readings.write().await.extend(readings);
    }

    pub async fn stored(&self) -> Vec<PredictionResult> {
        self.stored.read().await.clone()
    }

    /// Number of store attempts, failed ones included
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadingSource for MemoryStore {
    async fn fetch_latest(&self, limit: usize) -> Result<Vec<SensorReading>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            bail!("reading source unavailable");
        }
        let readings = self.readings.read().await;
        let start = readings.len().saturating_sub(limit);
        Ok(readings[start..].to_vec())
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn store(&self, result: &PredictionResult) -> Result<()> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_store.load(Ordering::SeqCst) {
            bail!("result sink unavailable");
        }
        self.stored.write().await.push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{readings, MIDPOINT_FEATURES};

    #[tokio::test]
    async fn test_fetch_returns_trailing_readings() {
        let input = readings("d1", 15, MIDPOINT_FEATURES);
        let store = MemoryStore::with_readings(input.clone());

        let latest = store.fetch_latest(11).await.unwrap();
        assert_eq!(latest.len(), 11);
        assert_eq!(latest[0], input[4]);
        assert_eq!(store.fetch_latest(100).await.unwrap().len(), 15);
        assert_eq!(store.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let store = MemoryStore::new();
        store.set_fail_fetch(true);
        assert!(store.fetch_latest(1).await.is_err());
        store.set_fail_fetch(false);
        assert!(store.fetch_latest(1).await.unwrap().is_empty());
    }
}
