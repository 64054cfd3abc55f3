//! Pool configuration
//!
//! Immutable after construction: worker bounds, queue capacity, breaker
//! thresholds, and the scaler cadence are all set once and read-only for
//! the pool's lifetime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerConfig, BreakerConfigError};

/// Configuration validation errors, fatal at construction
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Lower concurrency bound above the upper bound
    #[error("min_workers ({min}) must not exceed max_workers ({max})")]
    WorkerBounds { min: usize, max: usize },

    /// A pool with no workers can never make progress
    #[error("min_workers must be at least 1")]
    NoWorkers,

    /// Queue capacity must be positive
    #[error("queue_capacity must be greater than zero")]
    QueueCapacity,

    /// Circuit breaker thresholds out of range
    #[error(transparent)]
    Breaker(#[from] BreakerConfigError),
}

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use conveyor::{BreakerConfig, PoolConfig};
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_worker_bounds(2, 8)
///     .with_queue_capacity(64)
///     .with_breaker(BreakerConfig::default().with_failure_ratio(0.5))
///     .with_scale_check_interval(Duration::from_millis(250));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Lower bound on concurrency; this many workers start immediately
    pub min_workers: usize,

    /// Upper bound on concurrency
    pub max_workers: usize,

    /// Maximum buffered tasks; enqueue fails fast beyond this
    pub queue_capacity: usize,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,

    /// How often the adaptive scaler evaluates backlog
    #[serde(with = "duration_millis")]
    pub scale_check_interval: Duration,

    /// Bounded wait for cooperative exit after the grace period elapses
    #[serde(with = "duration_millis")]
    pub force_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            queue_capacity: 64,
            breaker: BreakerConfig::default(),
            scale_check_interval: Duration::from_millis(250),
            force_poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker concurrency bounds
    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the circuit breaker configuration
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the scaler evaluation interval
    pub fn with_scale_check_interval(mut self, interval: Duration) -> Self {
        self.scale_check_interval = interval;
        self
    }

    /// Set the bounded post-cancellation wait used at forced shutdown
    pub fn with_force_poll_interval(mut self, interval: Duration) -> Self {
        self.force_poll_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers < 1 {
            return Err(ConfigError::NoWorkers);
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::WorkerBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::QueueCapacity);
        }
        self.breaker.validate()?;
        Ok(())
    }
}

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
