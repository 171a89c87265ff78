//! Bounded retry with exponential backoff and jitter
//!
//! Shared by the session bootstrap and the signaling request paths. The
//! restart controls use [`restart_delay`] for their randomized reschedule
//! windows.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry policy configuration
///
/// Controls how a fallible async operation is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (default: 5)
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 500ms)
    pub backoff_initial_ms: u64,
    /// Minimum backoff delay in milliseconds (default: 100ms)
    pub backoff_min_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 3000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 500,
            backoff_min_ms: 100,
            backoff_max_ms: 3000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate backoff duration for a given attempt number (0-indexed)
    ///
    /// Exponential backoff scaled by a 0.75–1.25 jitter factor, clamped to
    /// the [min, max] window.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);

        let final_ms = if self.jitter_enabled {
            let factor = rand::thread_rng().gen_range(0.75..1.25);
            backoff_ms * factor
        } else {
            backoff_ms
        };

        let final_ms = final_ms
            .max(self.backoff_min_ms as f64)
            .min(self.backoff_max_ms as f64);

        Duration::from_millis(final_ms as u64)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Run `op` until it succeeds, a non-retriable error occurs, or the retry
/// budget is exhausted.
///
/// `is_retriable` decides which errors are worth another attempt; errors it
/// rejects propagate immediately. Exhausting the budget yields the last error.
pub async fn retry<T, F, Fut, P>(policy: &RetryPolicy, is_retriable: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !is_retriable(&e) {
                    return Err(e);
                }
                if !policy.should_retry(attempt) {
                    warn!(attempt, error = %e, "retry budget exhausted");
                    return Err(e);
                }
                let delay = policy.backoff_delay(attempt);
                debug!(attempt, ?delay, error = %e, "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Randomized restart delay: uniform over [base − 500ms, base + 500ms).
///
/// Bases below 500ms collapse the lower bound to zero instead of underflowing.
pub fn restart_delay(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let low = base_ms.saturating_sub(500);
    let high = base_ms + 500;
    Duration::from_millis(rand::thread_rng().gen_range(low..high))
}
