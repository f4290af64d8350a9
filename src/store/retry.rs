use std::future::Future;
use std::time::Duration;

use crate::error::{Result, RiskError};

/// Exponential backoff for batch writes: `base_delay`, then doubled per retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Run `op` until it succeeds, retrying retryable errors up to `policy.max_retries` times.
///
/// Non-retryable errors return immediately. Exhausting the retries yields
/// [`RiskError::RetriesExhausted`] so callers never mistake it for a partial success.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = policy.base_delay;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    log::info!("{} succeeded after {} retries", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                log::warn!(
                    "{} failed (retry {}/{} in {:?}): {}",
                    operation,
                    attempt + 1,
                    policy.max_retries,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(RiskError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt + 1,
                    last_error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}
