//! Consumer configuration structures

use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::retry::RetryPolicy;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Maximum allowed retry attempts to prevent DoS
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Maximum backoff duration to prevent excessive delays
const MAX_BACKOFF_MS: u64 = 3_600_000; // 1 hour
/// Maximum multiplier to prevent exponential explosion
const MAX_MULTIPLIER: f64 = 100.0;
/// Maximum commit and shutdown timeout
const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Prefix of every environment key read by [`ConsumerConfig::from_env`]
pub const ENV_PREFIX: &str = "CONSUMER_";

/// Validate retry count within reasonable bounds
fn validate_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "retry count {} exceeds maximum allowed value {}",
            value, MAX_RETRY_ATTEMPTS
        )));
    }
    Ok(value)
}

/// Validate delay within reasonable bounds
fn validate_delay_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u64::deserialize(deserializer)?;
    if value > MAX_BACKOFF_MS {
        return Err(serde::de::Error::custom(format!(
            "delay {}ms exceeds maximum allowed {}ms",
            value, MAX_BACKOFF_MS
        )));
    }
    Ok(value)
}

/// Validate timeout within reasonable bounds
fn validate_timeout_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u64::deserialize(deserializer)?;
    if value > MAX_TIMEOUT_SECONDS {
        return Err(serde::de::Error::custom(format!(
            "timeout {}s exceeds maximum allowed {}s",
            value, MAX_TIMEOUT_SECONDS
        )));
    }
    Ok(value)
}

/// Validate multiplier within reasonable bounds
fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "retry_backoff_multiplier {} must be finite and between 1.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

/// Process-wide consumer configuration.
///
/// Loaded once at startup and shared read-only (`Arc<ConsumerConfig>`) by every
/// component afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Retries after the first failed attempt of a transient error
    #[serde(deserialize_with = "validate_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(deserialize_with = "validate_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Upper bound for any single retry delay
    #[serde(deserialize_with = "validate_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Exponential growth factor between retries
    #[serde(deserialize_with = "validate_multiplier")]
    pub retry_backoff_multiplier: f64,

    /// Timeout handed to every synchronous offset commit
    #[serde(deserialize_with = "validate_timeout_seconds")]
    pub commit_timeout_seconds: u64,

    /// Invoke the DLQ fallback hook once DLQ publishing is exhausted
    pub enable_dlq_fallback: bool,

    /// Publish attempts against the DLQ before giving up
    #[serde(deserialize_with = "validate_retries")]
    pub dlq_max_retries: u32,

    /// How long shutdown waits for in-flight tasks
    #[serde(deserialize_with = "validate_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    /// Concurrency bound of the processing executor
    pub max_concurrent_tasks: usize,

    /// Fixed delay before the single commit retry
    #[serde(deserialize_with = "validate_delay_ms")]
    pub commit_retry_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 10_000,
            retry_backoff_multiplier: 2.0,
            commit_timeout_seconds: 5,
            enable_dlq_fallback: false,
            dlq_max_retries: 3,
            shutdown_timeout_seconds: 30,
            max_concurrent_tasks: 256,
            commit_retry_delay_ms: 100,
        }
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the maximum number of retries for transient errors
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the initial retry delay
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.config.initial_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the maximum retry delay
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the backoff multiplier
    pub fn retry_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.config.commit_timeout_seconds = timeout.as_secs();
        self
    }

    pub fn enable_dlq_fallback(mut self, enable: bool) -> Self {
        self.config.enable_dlq_fallback = enable;
        self
    }

    /// Set the number of DLQ publish attempts
    pub fn dlq_max_retries(mut self, retries: u32) -> Self {
        self.config.dlq_max_retries = retries;
        self
    }

    /// Set the graceful shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_seconds = timeout.as_secs();
        self
    }

    /// Set the executor concurrency bound
    pub fn max_concurrent_tasks(mut self, max: usize) -> Self {
        self.config.max_concurrent_tasks = max;
        self
    }

    pub fn commit_retry_delay(mut self, delay: Duration) -> Self {
        self.config.commit_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Load the configuration from `CONSUMER_*` environment variables.
    ///
    /// Unset keys keep their defaults; malformed values are rejected.
    pub fn from_env() -> ConsumerResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_value("MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = env_value("INITIAL_RETRY_DELAY_MS")? {
            config.initial_retry_delay_ms = v;
        }
        if let Some(v) = env_value("MAX_RETRY_DELAY_MS")? {
            config.max_retry_delay_ms = v;
        }
        if let Some(v) = env_value("RETRY_BACKOFF_MULTIPLIER")? {
            config.retry_backoff_multiplier = v;
        }
        if let Some(v) = env_value("COMMIT_TIMEOUT_SECONDS")? {
            config.commit_timeout_seconds = v;
        }
        if let Some(v) = env_value("ENABLE_DLQ_FALLBACK")? {
            config.enable_dlq_fallback = v;
        }
        if let Some(v) = env_value("DLQ_MAX_RETRIES")? {
            config.dlq_max_retries = v;
        }
        if let Some(v) = env_value("SHUTDOWN_TIMEOUT_SECONDS")? {
            config.shutdown_timeout_seconds = v;
        }
        if let Some(v) = env_value("MAX_CONCURRENT_TASKS")? {
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = env_value("COMMIT_RETRY_DELAY_MS")? {
            config.commit_retry_delay_ms = v;
        }

        config.validate().map_err(ConsumerError::ConfigError)?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> ConsumerResult<Self> {
        let config: ConsumerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ConsumerError::ConfigError(format!("Invalid YAML config: {}", e)))?;
        config.validate().map_err(ConsumerError::ConfigError)?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConsumerResult<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > MAX_RETRY_ATTEMPTS || self.dlq_max_retries > MAX_RETRY_ATTEMPTS {
            return Err(format!(
                "Retry counts cannot exceed {}",
                MAX_RETRY_ATTEMPTS
            ));
        }

        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err("Initial retry delay cannot exceed max retry delay".to_string());
        }

        if self.max_retry_delay_ms > MAX_BACKOFF_MS {
            return Err(format!("Max retry delay cannot exceed {}ms", MAX_BACKOFF_MS));
        }

        if !self.retry_backoff_multiplier.is_finite()
            || !(1.0..=MAX_MULTIPLIER).contains(&self.retry_backoff_multiplier)
        {
            return Err(format!(
                "Backoff multiplier must be between 1.0 and {}",
                MAX_MULTIPLIER
            ));
        }

        if self.commit_timeout_seconds == 0 {
            return Err("Commit timeout must be greater than 0".to_string());
        }

        if self.commit_timeout_seconds > MAX_TIMEOUT_SECONDS
            || self.shutdown_timeout_seconds > MAX_TIMEOUT_SECONDS
        {
            return Err(format!(
                "Commit and shutdown timeouts cannot exceed {}s",
                MAX_TIMEOUT_SECONDS
            ));
        }

        if self.max_concurrent_tasks == 0 {
            return Err("Max concurrent tasks must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn commit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.commit_retry_delay_ms)
    }

    /// Backoff policy of the processing retry loop
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.initial_retry_delay(),
            self.max_retry_delay(),
            self.retry_backoff_multiplier,
        )
    }

    /// Backoff policy of DLQ publishing; `max_retries` is the attempt budget
    pub fn dlq_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.dlq_max_retries,
            ..self.retry_policy()
        }
    }
}

fn env_value<T>(key: &str) -> ConsumerResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}{}", ENV_PREFIX, key);
    match std::env::var(&name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ConsumerError::ConfigError(format!("Invalid value {:?} for {}: {}", raw, name, e))
        }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConsumerError::ConfigError(format!("{}: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_keys() {
        let config = ConsumerConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_retry_delay(), Duration::from_millis(1000));
        assert_eq!(config.max_retry_delay(), Duration::from_secs(10));
        assert_eq!(config.retry_backoff_multiplier, 2.0);
        assert_eq!(config.commit_timeout(), Duration::from_secs(5));
        assert!(!config.enable_dlq_fallback);
        assert_eq!(config.dlq_max_retries, 3);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ConsumerConfig::builder()
            .max_retries(5)
            .initial_retry_delay(Duration::from_millis(50))
            .max_retry_delay(Duration::from_millis(400))
            .enable_dlq_fallback(true)
            .shutdown_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_retry_delay_ms, 50);
        assert_eq!(config.max_retry_delay_ms, 400);
        assert!(config.enable_dlq_fallback);
        assert_eq!(config.shutdown_timeout_seconds, 5);

        let policy = config.dlq_retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_validation() {
        let inverted = ConsumerConfig::builder()
            .initial_retry_delay(Duration::from_secs(20))
            .max_retry_delay(Duration::from_secs(10))
            .build();
        assert!(inverted.validate().is_err());

        let shrinking = ConsumerConfig::builder().retry_backoff_multiplier(0.5).build();
        assert!(shrinking.validate().is_err());

        let no_workers = ConsumerConfig::builder().max_concurrent_tasks(0).build();
        assert!(no_workers.validate().is_err());

        let endless_shutdown = ConsumerConfig::builder()
            .shutdown_timeout(Duration::from_secs(u64::MAX))
            .build();
        assert!(endless_shutdown.validate().is_err());

        let endless_commit = ConsumerConfig::builder()
            .commit_timeout(Duration::from_secs(7200))
            .build();
        assert!(endless_commit.validate().is_err());
    }

    #[test]
    fn test_yaml_partial_document_keeps_defaults() {
        let config = ConsumerConfig::from_yaml_str(
            "max_retries: 7\nenable_dlq_fallback: true\nshutdown_timeout_seconds: 12\n",
        )
        .unwrap();

        assert_eq!(config.max_retries, 7);
        assert!(config.enable_dlq_fallback);
        assert_eq!(config.shutdown_timeout_seconds, 12);
        assert_eq!(config.initial_retry_delay_ms, 1000);
    }

    #[test]
    fn test_yaml_rejects_out_of_bounds_values() {
        assert!(ConsumerConfig::from_yaml_str("max_retries: 10000\n").is_err());
        assert!(ConsumerConfig::from_yaml_str("retry_backoff_multiplier: -1.0\n").is_err());
        assert!(ConsumerConfig::from_yaml_str("initial_retry_delay_ms: 7200000\n").is_err());
        assert!(
            ConsumerConfig::from_yaml_str("shutdown_timeout_seconds: 18446744073709551615\n")
                .is_err()
        );
        assert!(ConsumerConfig::from_yaml_str("commit_timeout_seconds: 3601\n").is_err());
        assert!(ConsumerConfig::from_yaml_str("shutdown_timeout_seconds: 3600\n").is_ok());
    }
}
