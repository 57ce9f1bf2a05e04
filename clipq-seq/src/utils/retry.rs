//! Bounded retry with exponential backoff
//!
//! Used by the feedback consumer around provider calls, and for the worker
//! loops' redelivery delays. The resequencer itself never retries: a failure it
//! cannot decide on goes back to the transport.
//!
//! **Backoff Strategy:**
//! - First retry waits `initial_backoff`
//! - Each further retry doubles the wait, capped at `max_backoff`
//! - Non-transient errors fail immediately

use clipq_common::config::RetryConfig;
use std::future::Future;
use std::time::{Duration, Instant};

/// Retry limits for one class of external call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Wait before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        exponential_backoff(self.initial_backoff, self.max_backoff, retry.saturating_sub(1))
    }
}

/// `base * 2^doublings`, capped at `max`
pub fn exponential_backoff(base: Duration, max: Duration, doublings: u32) -> Duration {
    let factor = 1u32.checked_shl(doublings.min(31)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out
///
/// Returns the last error when every attempt failed.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start_time = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_transient(&err) {
                    return Err(err);
                }

                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        error = %err,
                        "Operation failed: retries exhausted"
                    );
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient failure, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
