use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Windowing parameters for batched delivery modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Number of events that forces a batch out, regardless of the window.
    pub max_size: usize,

    /// How long the earliest pending event may wait before its batch is
    /// emitted anyway.
    pub max_wait: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Backoff and give-up parameters for at-least-once retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff interval; doubles on every failed attempt.
    pub base: Duration,

    /// Upper bound on the backoff interval.
    pub max: Duration,

    /// Additive random jitter applied on top of the backoff.
    pub jitter: Duration,

    /// How long a webhook may stay continuously in retry before it is
    /// transitioned to unavailable and its queue discarded.
    pub failure_horizon: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60 * 60),
            jitter: Duration::ZERO,
            failure_horizon: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Process-wide configuration for the delivery server.
///
/// `batching: None` disables batched delivery modes entirely; events for
/// batched webhooks are then refused with an `InvalidStateChange` error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Batch window settings, or `None` to disable batched modes.
    pub batching: Option<BatchingConfig>,

    /// Retry backoff settings.
    pub retry: RetryConfig,

    /// How long shutdown waits for in-flight deliveries before abandoning
    /// them.
    pub drain_deadline: Duration,

    /// Capacity of the error broadcast channel.
    pub error_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            batching: Some(BatchingConfig::default()),
            retry: RetryConfig::default(),
            drain_deadline: Duration::from_secs(30),
            error_buffer: 128,
        }
    }
}

impl ServerConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(batching) = &self.batching {
            if batching.max_size < 1 {
                return Err(ServerError::internal("batching.max-size must be at least 1"));
            }
            if batching.max_wait.is_zero() {
                return Err(ServerError::internal("batching.max-wait must be positive"));
            }
        }
        if self.retry.base.is_zero() {
            return Err(ServerError::internal("retry.base must be positive"));
        }
        if self.retry.max < self.retry.base {
            return Err(ServerError::internal("retry.max must be at least retry.base"));
        }
        if self.error_buffer < 1 {
            return Err(ServerError::internal("errors.buffer must be at least 1"));
        }
        Ok(())
    }
}
