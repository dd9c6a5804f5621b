//! Exponential backoff for transient query failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::DatabaseError;

/// Retry policy for queue queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay after the first failure; doubles on every further failure.
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(800),
            max_jitter: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay * factor + jitter
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// Returns the last error when every attempt failed.
pub async fn with_retry<T, F, Fut>(
    name: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                warn!(operation = name, attempts, error = %e, "Giving up after retries");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = name,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Query failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
