//! Retrying invoker: bounded retry with exponential backoff.
//!
//! Every backend call made by the pipeline (upload, each generator, each
//! evaluator) goes through [`RetryPolicy::invoke`]. Pools never retry on
//! their own; this is the single place retry policy lives.
//!
//! ```text
//! attempt 0 ── fail ── sleep(base·2^0) ── attempt 1 ── fail ── sleep(base·2^1) ── ...
//!                                                          └─ budget spent → last error
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Retry policy for backend calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u64).min(self.max_delay_ms)
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// The last error is returned unchanged. `label` only feeds the logs.
    pub async fn invoke<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if self.should_retry(attempt) => {
                    let delay = self.backoff_duration(attempt);
                    warn!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(label, attempts = attempt + 1, error = %err, "retry budget exhausted");
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 2 attempts, 800ms base delay, 2x multiplier, 10s cap.
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 800,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}
