//! Predictor configuration
//!
//! Read from an optional `predictor.{toml,yaml,json}` file and `PREDICTOR_*`
//! environment variables, environment taking precedence.

use anyhow::{Context, Result};
use health_lib::store::SupabaseConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// Name attached to structured log events
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health, metrics and manual triggers
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory holding the trained model artifacts
    #[serde(default = "default_model_dir")]
    pub model_dir: String,

    /// Seconds between scheduled ticks
    #[serde(default = "default_prediction_interval")]
    pub prediction_interval_secs: u64,

    /// Supabase project URL; without it readings come from the in-memory store
    #[serde(default = "default_supabase_url")]
    pub supabase_url: Option<String>,

    #[serde(default = "default_supabase_key")]
    pub supabase_key: Option<String>,

    /// Only read readings of this device. Leave unset only when a single
    /// device writes to the table: a fetch spanning several devices cannot
    /// form a window and the tick is skipped.
    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "health-predictor".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_model_dir() -> String {
    "models".to_string()
}

fn default_prediction_interval() -> u64 {
    60
}

fn default_supabase_url() -> Option<String> {
    std::env::var("SUPABASE_URL").ok().filter(|v| !v.is_empty())
}

fn default_supabase_key() -> Option<String> {
    std::env::var("SUPABASE_KEY").ok().filter(|v| !v.is_empty())
}

fn default_request_timeout() -> u64 {
    30
}

impl PredictorConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("predictor").required(false))
            .add_source(config::Environment::with_prefix("PREDICTOR"))
            .build()
            .context("Failed to read configuration")?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        let parsed: Self = config.try_deserialize().context("Invalid predictor configuration")?;
        if parsed.prediction_interval_secs == 0 {
            anyhow::bail!("prediction_interval_secs must be at least 1");
        }
        Ok(parsed)
    }

    pub fn prediction_interval(&self) -> Duration {
        Duration::from_secs(self.prediction_interval_secs)
    }

    /// Data-store connection, when both URL and key are configured
    pub fn supabase(&self) -> Option<SupabaseConfig> {
        match (&self.supabase_url, &self.supabase_key) {
            (Some(url), Some(key)) => Some(SupabaseConfig {
                url: url.clone(),
                api_key: key.clone(),
                device_id: self.device_id.clone(),
                timeout: Duration::from_secs(self.request_timeout_secs),
            }),
            _ => None,
        }
    }
}
