use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::errors::{Result, ScrapeError};
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How long the limiter refuses work after a security challenge.
    pub block_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            block_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)` plus up to
    /// one second of jitter, never above `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
        (exp + jitter).min(self.max_delay)
    }
}

/// Only transient browser and network failures are retried.
pub fn default_classifier(err: &ScrapeError) -> RetryDecision {
    if err.is_transient() {
        RetryDecision::Retry
    } else {
        RetryDecision::Abort
    }
}

/// Run `operation` up to `policy.max_attempts` times.
///
/// A security challenge aborts at once and puts `limiter` into its cooldown.
/// Other errors go through `classify`; retried ones wait for
/// [`RetryPolicy::backoff`] first.
pub async fn with_retry<T, F, Fut, C>(
    policy: &RetryPolicy,
    limiter: Option<&RateLimiter>,
    classify: C,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&ScrapeError) -> RetryDecision,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_blocked() {
                    if let (ScrapeError::Blocked { .. }, Some(limiter)) = (&err, limiter) {
                        limiter.block_for(policy.block_cooldown);
                    }
                    warn!(attempt, error = %err, "blocked, aborting run");
                    return Err(err);
                }
                if classify(&err) == RetryDecision::Abort {
                    return Err(err);
                }
                if attempt >= max_attempts {
                    warn!(attempt, error = %err, "giving up after final attempt");
                    return Err(err);
                }
                let delay = policy.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying after backoff"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
