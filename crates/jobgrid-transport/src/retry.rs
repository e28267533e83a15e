//! Retry with exponential backoff for connection attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt. `None` retries forever.
    pub max_retries: Option<u32>,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Adds up to 50% random jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    Exhausted {
        last_error: TransportError,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails permanently or the retries run out.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    let maxed_out = self
                        .config
                        .max_retries
                        .is_some_and(|max| attempt > max);
                    if !is_retryable(&e) || maxed_out {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    tokio::time::sleep(self.backoff_for(attempt - 1)).await;
                }
            }
        }
    }

    /// `initial_backoff * multiplier^attempt`, capped at `max_backoff`, plus jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_backoff.as_millis() as f64;
        let max_ms = self.config.max_backoff.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let capped = (base_ms * self.config.backoff_multiplier.powi(exponent)).min(max_ms) as u64;

        if self.config.jitter && capped > 1 {
            let jitter = rand::thread_rng().gen_range(0..capped / 2 + 1);
            Duration::from_millis(capped.saturating_add(jitter))
        } else {
            Duration::from_millis(capped)
        }
    }
}

/// Errors a new connection attempt may fix.
pub fn is_retryable(error: &TransportError) -> bool {
    error.is_transient()
}
