//! # Retry Policy
//!
//! Bounded retries with exponential backoff and a per-attempt timeout.
//!
//! ```text
//! attempt 1 ──✗──▶ sleep 1s ──▶ attempt 2 ──✗──▶ sleep 2s ──▶ attempt 3
//!           ──✗──▶ sleep 4s ──▶ attempt 4 ──✗──▶ give up (last error)
//!
//! Only transient errors (SyncError::is_retryable) are retried. A 404 or a
//! decode failure returns after the first attempt.
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::DashboardConfig;
use crate::error::{SyncError, SyncResult};

/// How hard a source call is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DashboardConfig) -> Self {
        RetryPolicy {
            max_retries: config.retry.max_retries,
            initial_backoff: config.retry.initial_backoff(),
            max_backoff: config.retry.max_backoff(),
            multiplier: config.retry.multiplier,
            attempt_timeout: config.request_timeout(),
        }
    }

    /// Single attempt, no retries.
    pub fn once(attempt_timeout: Duration) -> Self {
        RetryPolicy {
            max_retries: 0,
            attempt_timeout,
            ..Default::default()
        }
    }

    /// Creates the exponential backoff schedule. No jitter, no elapsed-time cap:
    /// the retry count bounds the loop.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or the retry budget
    /// is spent. Returns the last error.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.attempt_timeout.as_secs())),
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt > self.max_retries {
                debug!(%label, attempt, error = %err, "Giving up");
                return Err(err);
            }

            let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
            warn!(%label, attempt, ?delay, error = %err, "Attempt failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
