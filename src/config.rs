//! Pipeline configuration.
//!
//! Every knob has a default, so an empty JSON object is a valid config.
//! Loading is intentionally thin: read a file, deserialize, validate.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Allow traffic when the decision path is unavailable.
    Open,
    /// Block traffic when the decision path is unavailable.
    Closed,
}

impl Default for FailMode {
    fn default() -> Self {
        FailMode::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Admission
    pub sampling_rate: f64,
    pub global_rate_limit: u32,
    pub per_function_rate_limit: u32,
    pub rate_window_ms: u64,
    pub rate_buckets: u32,
    pub throttle_threshold: f64,
    pub queue_capacity: usize,
    pub backpressure_threshold: f64,
    pub backpressure_floor_rate: f64,

    // Connector
    pub fail_mode: FailMode,
    pub brain_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_cap_ms: u64,
    /// Per-source buffer between the dispatcher and that source's lane.
    pub source_lane_capacity: usize,

    // Security
    pub nonce_freshness_window_s: u64,
    pub nonce_cache_capacity: usize,
    pub key_rotation_grace_s: u64,

    // Decision engine
    pub anomaly_threshold: f64,
    pub baseline_min_samples: u64,
    pub pattern_cache_enabled: bool,
    pub pattern_cache_ttl_s: u64,
    pub pattern_cache_capacity: usize,
    pub pattern_match_threshold: f64,

    // Error recovery
    pub error_threshold: usize,
    pub degraded_mode_threshold: usize,
    pub time_window_seconds: u64,
    pub recovery_cooldown_seconds: u64,

    pub shutdown_grace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 1.0,
            global_rate_limit: 10_000,
            per_function_rate_limit: 1_000,
            rate_window_ms: 1_000,
            rate_buckets: 10,
            throttle_threshold: 0.8,
            queue_capacity: 10_000,
            backpressure_threshold: 0.8,
            backpressure_floor_rate: 0.05,

            fail_mode: FailMode::Open,
            brain_timeout_ms: 50,
            retry_attempts: 3,
            retry_backoff_ms: 10,
            retry_backoff_cap_ms: 200,
            source_lane_capacity: 1_024,

            nonce_freshness_window_s: 300,
            nonce_cache_capacity: 1_000_000,
            key_rotation_grace_s: 300,

            anomaly_threshold: 0.7,
            baseline_min_samples: 20,
            pattern_cache_enabled: true,
            pattern_cache_ttl_s: 1_800,
            pattern_cache_capacity: 10_000,
            pattern_match_threshold: 0.85,

            error_threshold: 10,
            degraded_mode_threshold: 50,
            time_window_seconds: 60,
            recovery_cooldown_seconds: 60,

            shutdown_grace_ms: 2_000,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn unit(field: &'static str, v: f64) -> Result<(), ConfigError> {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid { field, reason: format!("{} is outside [0, 1]", v) });
            }
            Ok(())
        }
        fn positive(field: &'static str, v: u64) -> Result<(), ConfigError> {
            if v == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
            }
            Ok(())
        }

        unit("sampling_rate", self.sampling_rate)?;
        unit("throttle_threshold", self.throttle_threshold)?;
        unit("backpressure_threshold", self.backpressure_threshold)?;
        unit("backpressure_floor_rate", self.backpressure_floor_rate)?;
        unit("anomaly_threshold", self.anomaly_threshold)?;
        unit("pattern_match_threshold", self.pattern_match_threshold)?;

        positive("global_rate_limit", self.global_rate_limit as u64)?;
        positive("per_function_rate_limit", self.per_function_rate_limit as u64)?;
        positive("rate_window_ms", self.rate_window_ms)?;
        positive("rate_buckets", self.rate_buckets as u64)?;
        positive("queue_capacity", self.queue_capacity as u64)?;
        positive("brain_timeout_ms", self.brain_timeout_ms)?;
        positive("retry_attempts", self.retry_attempts as u64)?;
        positive("source_lane_capacity", self.source_lane_capacity as u64)?;
        positive("pattern_cache_ttl_s", self.pattern_cache_ttl_s)?;
        positive("pattern_cache_capacity", self.pattern_cache_capacity as u64)?;
        positive("nonce_freshness_window_s", self.nonce_freshness_window_s)?;
        positive("nonce_cache_capacity", self.nonce_cache_capacity as u64)?;
        positive("error_threshold", self.error_threshold as u64)?;
        positive("time_window_seconds", self.time_window_seconds)?;
        positive("recovery_cooldown_seconds", self.recovery_cooldown_seconds)?;

        if self.degraded_mode_threshold < self.error_threshold {
            return Err(ConfigError::Invalid {
                field: "degraded_mode_threshold",
                reason: format!(
                    "{} is below error_threshold {}",
                    self.degraded_mode_threshold, self.error_threshold
                ),
            });
        }
        Ok(())
    }

    pub fn brain_timeout(&self) -> Duration {
        Duration::from_millis(self.brain_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_cap_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
