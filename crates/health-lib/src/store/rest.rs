//! Supabase (PostgREST) adapter
//!
//! Readings come from the `sensor_data` table, newest first, and are
//! returned ascending. Predictions are inserted into the `predictions`
//! table. Both requests authenticate with the project key sent as `apikey`
//! and as a bearer token.

use super::{async_trait, ReadingSource, ResultSink};
use crate::models::{PredictionResult, SensorReading, FEATURE_NAMES, NUM_FEATURES};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime};
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const SENSOR_TABLE: &str = "rest/v1/sensor_data";
const PREDICTION_TABLE: &str = "rest/v1/predictions";

/// Device id recorded for rows without one
const UNKNOWN_DEVICE: &str = "unknown";

/// Timestamp layout written to the predictions table
const PAYLOAD_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Connection settings for a Supabase project
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub api_key: String,
    /// Restrict reads to one device
    pub device_id: Option<String>,
    pub timeout: Duration,
}

impl SupabaseConfig {
    /// Whether reads are filtered to a single device. An unscoped source
    /// fed by several devices yields windows that mix them.
    pub fn is_device_scoped(&self) -> bool {
        self.device_id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }
}

/// Reads sensor data from and writes predictions to Supabase
pub struct SupabaseStore {
    client: Client,
    base_url: Url,
    api_key: String,
    device_id: Option<String>,
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        // a trailing slash keeps any path prefix when joining table paths
        let mut base = config.url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("Invalid Supabase URL")?;

        let device_id = if config.is_device_scoped() {
            config.device_id.clone()
        } else {
            warn!(
                event = "reading_source_unscoped",
                url = %base_url,
                "No device_id configured; ticks are skipped whenever the latest readings span several devices"
            );
            None
        };

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            device_id,
        })
    }

    fn endpoint(&self, table: &str) -> Result<Url> {
        self.base_url.join(table).context("Invalid table path")
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

#[async_trait]
impl ReadingSource for SupabaseStore {
    async fn fetch_latest(&self, limit: usize) -> Result<Vec<SensorReading>> {
        let mut url = self.endpoint(SENSOR_TABLE)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("select", "*")
                .append_pair("order", "timestamp.desc")
                .append_pair("limit", &limit.to_string());
            if let Some(device_id) = &self.device_id {
                query.append_pair("device_id", &format!("eq.{}", device_id));
            }
        }

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .context("Failed to query sensor data")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Sensor data query failed ({}): {}", status, body);
        }

        let rows: Vec<Value> = response.json().await.context("Failed to parse sensor data")?;
        debug!(rows = rows.len(), "Fetched sensor rows");
        Ok(parse_sensor_rows(rows))
    }
}

#[async_trait]
impl ResultSink for SupabaseStore {
    async fn store(&self, result: &PredictionResult) -> Result<()> {
        let url = self.endpoint(PREDICTION_TABLE)?;
        let response = self
            .authorized(self.client.post(url))
            .header("Prefer", "return=minimal")
            .json(&prediction_payload(result))
            .send()
            .await
            .context("Failed to send prediction")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Prediction insert failed ({}): {}", status, body);
        }
        Ok(())
    }
}

/// Convert newest-first rows into ascending readings
///
/// Rows whose timestamp cannot be parsed are dropped.
pub fn parse_sensor_rows(rows: Vec<Value>) -> Vec<SensorReading> {
    let mut readings: Vec<SensorReading> = rows
        .iter()
        .filter_map(|row| {
            let Some(object) = row.as_object() else {
                warn!("Skipping non-object sensor row");
                return None;
            };
            let raw_timestamp = object.get("timestamp").and_then(Value::as_str).unwrap_or_default();
            let Some(timestamp) = parse_timestamp(raw_timestamp) else {
                warn!(timestamp = %raw_timestamp, "Skipping sensor row with unparseable timestamp");
                return None;
            };

            let mut features = [0.0; NUM_FEATURES];
            for (value, name) in features.iter_mut().zip(FEATURE_NAMES) {
                *value = number_field(object, name);
            }
            Some(SensorReading::new(device_field(object), timestamp, features))
        })
        .collect();
    readings.reverse();
    readings
}

/// Parse the timestamp layouts PostgREST emits
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
}

fn number_field(row: &Map<String, Value>, name: &str) -> f64 {
    match row.get(name) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn device_field(row: &Map<String, Value>) -> String {
    match row.get("device_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => UNKNOWN_DEVICE.to_string(),
    }
}

/// Row inserted into the predictions table
///
/// The table has no part column, so a real part at risk is folded into the
/// `rul` field as text.
pub fn prediction_payload(result: &PredictionResult) -> Value {
    let rul = if result.part_at_risk.is_component() {
        Value::String(format!(
            "{} (Part at risk: {})",
            format_rul(result.remaining_useful_life),
            result.part_at_risk
        ))
    } else {
        json!(result.remaining_useful_life)
    };

    json!({
        "timestamp": result.timestamp.format(PAYLOAD_TIMESTAMP_FORMAT).to_string(),
        "device_id": result.device_id,
        "is_anomaly": result.is_anomaly,
        "failure_prob": result.failure_probability,
        "health_index": result.health_index,
        "rul": rul,
    })
}

fn format_rul(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}
