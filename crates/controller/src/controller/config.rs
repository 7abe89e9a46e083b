//! Controller configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::RetryPolicy;

/// Controller configuration
///
/// # Example
///
/// ```
/// use keel_controller::ControllerConfig;
/// use std::time::Duration;
///
/// let config = ControllerConfig::default()
///     .with_workers(8)
///     .with_max_retries(3)
///     .with_sync_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,

    /// Consecutive failures tolerated per key before giving up
    pub max_retries: u32,

    /// Backoff curve for failed keys
    pub retry: RetryPolicy,

    /// Bounded wait for the initial listing/sync; startup-fatal on expiry
    #[serde(with = "duration_millis")]
    pub sync_timeout: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Entries retained in the drop log
    pub drop_log_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 5,
            retry: RetryPolicy::default(),
            sync_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            drop_log_capacity: 256,
        }
    }
}

impl ControllerConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count (at least 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the give-up threshold
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff curve
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the initial sync timeout
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set the graceful shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the drop log capacity
    pub fn with_drop_log_capacity(mut self, capacity: usize) -> Self {
        self.drop_log_capacity = capacity.max(1);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        if self.sync_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "sync_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration
    #[error("invalid controller configuration: {0}")]
    InvalidConfig(String),
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
