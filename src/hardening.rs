use std::future::Future;
use std::time::Duration;

use crate::types::{ObservedError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self::new(1, 0)
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && Self::is_retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    tracing::warn!(
                        "Open failed (attempt {}/{}): {}. Retrying in {:?} (jittered)...",
                        attempts,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exponential backoff with ±25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_delay = self.base_delay_ms.saturating_mul(2u64.pow(exponent));
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        let final_delay_ms = (base_delay as i64 + jitter).max(1) as u64;
        Duration::from_millis(final_delay_ms)
    }

    fn is_retryable(err: &ObservedError) -> bool {
        err.inner.is_retryable()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::constants::DEFAULT_MAX_RETRIES,
            crate::constants::DEFAULT_RETRY_BASE_MS,
        )
    }
}
