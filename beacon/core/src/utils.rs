use std::{future::Future, time::Duration};

use log::debug;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, returns a non-retryable error, or the policy's attempts
/// are exhausted. The last error is returned in the latter two cases.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    operation: F,
    label: &str,
    policy: RetryPolicy,
    is_retryable: R,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempts);
                debug!(
                    "Operation {} failed on attempt {}/{}: {}. Retrying after {:?}...",
                    label, attempts, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
