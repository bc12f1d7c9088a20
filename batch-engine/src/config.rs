//! Configuration for the batching engine

use crate::fees::FeePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted `max_wait_time_ms` (one day)
pub const MAX_WAIT_TIME_LIMIT_MS: u64 = 86_400_000;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Batch formation policy
    pub batch: BatchConfig,

    /// Retry policy
    pub retry: RetryConfig,

    /// Fee policy
    pub fees: FeePolicy,

    /// Submission settings
    pub submitter: SubmitterConfig,

    /// Expiration sweeper settings
    pub expiration: ExpirationConfig,

    /// Monitoring settings
    pub monitoring: MonitoringConfig,

    /// Lifecycle event delivery
    pub events: EventConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "batch-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            fees: FeePolicy::default(),
            submitter: SubmitterConfig::default(),
            expiration: ExpirationConfig::default(),
            monitoring: MonitoringConfig::default(),
            events: EventConfig::default(),
        }
    }
}

/// Batch formation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// A group this large forms a batch immediately
    pub max_batch_size: usize,

    /// Smaller timed-out groups are still formed, but logged as undersized
    pub min_batch_size: usize,

    /// Longest time the oldest member of a group may wait (milliseconds)
    pub max_wait_time_ms: u64,

    /// Batch former tick (milliseconds); capped at `max_wait_time_ms`
    pub tick_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            min_batch_size: 2,
            max_wait_time_ms: 5_000,
            tick_interval_ms: 1_000,
        }
    }
}

impl BatchConfig {
    /// Max wait as a chrono duration
    pub fn max_wait_time(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.max_wait_time_ms.min(MAX_WAIT_TIME_LIMIT_MS) as i64)
    }

    /// Effective batch former tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.min(self.max_wait_time_ms).max(1))
    }

    /// Check `0 < min <= max` and `0 < max_wait <= MAX_WAIT_TIME_LIMIT_MS`
    pub fn validate(&self) -> crate::Result<()> {
        if self.min_batch_size == 0 {
            return Err(crate::Error::Config(
                "min_batch_size must be > 0".to_string(),
            ));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(crate::Error::Config(format!(
                "min_batch_size ({}) must not exceed max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.max_wait_time_ms == 0 {
            return Err(crate::Error::Config(
                "max_wait_time_ms must be > 0".to_string(),
            ));
        }
        if self.max_wait_time_ms > MAX_WAIT_TIME_LIMIT_MS {
            return Err(crate::Error::Config(format!(
                "max_wait_time_ms must not exceed {}",
                MAX_WAIT_TIME_LIMIT_MS
            )));
        }
        Ok(())
    }
}

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry budget for requests that do not set their own
    pub default_max_retries: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Delay cap (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor between attempts
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            initial_delay_ms: 1_000,  // 1 second
            max_delay_ms: 60_000,     // 1 minute
            backoff_multiplier: 2.0,
        }
    }
}

/// Submission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Batches submitted concurrently
    pub max_concurrent_batches: usize,

    /// Timeout for a single ledger call (milliseconds)
    pub submit_timeout_ms: u64,

    /// Delay between confirmation polls (milliseconds)
    pub confirmation_poll_interval_ms: u64,

    /// Polls before an unconfirmed submission counts as timed out
    pub confirmation_attempts: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 4,
            submit_timeout_ms: 10_000,
            confirmation_poll_interval_ms: 500,
            confirmation_attempts: 10,
        }
    }
}

impl SubmitterConfig {
    /// Ledger call timeout
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Confirmation poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_interval_ms)
    }
}

/// Expiration sweeper settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// Sweep interval (milliseconds)
    pub sweep_interval_ms: u64,

    /// Pending/queued rows reloaded into the queue on start
    pub recovery_limit: usize,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            recovery_limit: 10_000,
        }
    }
}

/// Monitoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Sample interval (milliseconds)
    pub sample_interval_ms: u64,

    /// Un-submitted backlog that degrades health
    pub backlog_degraded: u64,

    /// Un-submitted backlog that makes the system unhealthy
    pub backlog_unhealthy: u64,

    /// Failure rate (0.0 - 1.0) that degrades health
    pub failure_rate_degraded: f64,

    /// Failure rate (0.0 - 1.0) that makes the system unhealthy
    pub failure_rate_unhealthy: f64,
}

/// Lifecycle event delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Events buffered for the publisher before new ones are dropped
    pub buffer_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 4_096,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 15_000,
            backlog_degraded: 1_000,
            backlog_unhealthy: 5_000,
            failure_rate_degraded: 0.05,
            failure_rate_unhealthy: 0.20,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Some(value) = env_parse("BATCH_ENGINE_MAX_BATCH_SIZE")? {
            config.batch.max_batch_size = value;
        }

        if let Some(value) = env_parse("BATCH_ENGINE_MIN_BATCH_SIZE")? {
            config.batch.min_batch_size = value;
        }

        if let Some(value) = env_parse("BATCH_ENGINE_MAX_WAIT_MS")? {
            config.batch.max_wait_time_ms = value;
        }

        if let Some(value) = env_parse("BATCH_ENGINE_MAX_RETRIES")? {
            config.retry.default_max_retries = value;
        }

        if let Some(value) = env_parse("BATCH_ENGINE_MONITORING_INTERVAL_MS")? {
            config.monitoring.sample_interval_ms = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> crate::Result<()> {
        self.batch.validate()?;
        self.fees.validate()?;

        if self.retry.backoff_multiplier < 1.0 {
            return Err(crate::Error::Config(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.submitter.max_concurrent_batches == 0 {
            return Err(crate::Error::Config(
                "max_concurrent_batches must be > 0".to_string(),
            ));
        }
        if self.submitter.submit_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "submit_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.events.buffer_capacity == 0 {
            return Err(crate::Error::Config(
                "events.buffer_capacity must be > 0".to_string(),
            ));
        }
        if self.expiration.sweep_interval_ms == 0 || self.monitoring.sample_interval_ms == 0 {
            return Err(crate::Error::Config(
                "sweep and sample intervals must be > 0".to_string(),
            ));
        }
        if self.monitoring.backlog_degraded > self.monitoring.backlog_unhealthy
            || self.monitoring.failure_rate_degraded > self.monitoring.failure_rate_unhealthy
        {
            return Err(crate::Error::Config(
                "degraded thresholds must not exceed unhealthy thresholds".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> crate::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| crate::Error::Config(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "batch-engine");
        assert_eq!(config.batch.max_batch_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_config_validation() {
        let mut batch = BatchConfig::default();
        batch.min_batch_size = 0;
        assert!(batch.validate().is_err());

        let mut batch = BatchConfig::default();
        batch.min_batch_size = 11;
        assert!(batch.validate().is_err());

        let mut batch = BatchConfig::default();
        batch.max_wait_time_ms = 0;
        assert!(batch.validate().is_err());

        let mut batch = BatchConfig::default();
        batch.max_wait_time_ms = u64::MAX;
        assert!(batch.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_and_buffers_rejected() {
        let mut config = Config::default();
        config.submitter.submit_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.events.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_capped_at_max_wait() {
        let batch = BatchConfig {
            max_batch_size: 5,
            min_batch_size: 2,
            max_wait_time_ms: 200,
            tick_interval_ms: 1_000,
        };
        assert_eq!(batch.tick_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [batch]
            max_batch_size = 5
            min_batch_size = 2
            max_wait_time_ms = 5000

            [retry]
            default_max_retries = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.batch.max_batch_size, 5);
        assert_eq!(config.batch.tick_interval_ms, 1_000);
        assert_eq!(config.retry.default_max_retries, 1);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.fees, FeePolicy::default());
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut config = Config::default();
        config.monitoring.failure_rate_degraded = 0.5;
        config.monitoring.failure_rate_unhealthy = 0.1;
        assert!(config.validate().is_err());
    }
}
