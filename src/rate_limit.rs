use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::errors::{Result, ScrapeError};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

/// Process-local token bucket. Holds at most `bucket_size` tokens and refills
/// lazily at `tokens_per_second` from the time of the last refill.
#[derive(Debug)]
pub struct RateLimiter {
    bucket_size: f64,
    tokens_per_second: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(bucket_size: f64, tokens_per_second: f64) -> Self {
        let bucket_size = bucket_size.max(1.0);
        Self {
            bucket_size,
            tokens_per_second: tokens_per_second.max(f64::EPSILON),
            state: Mutex::new(BucketState {
                tokens: bucket_size,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
        }
    }

    /// Take one token, sleeping until one is available. Fails fast while the
    /// limiter is cooling down after a detected block.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();
                if let Some(remaining) = Self::cooldown_remaining(&mut state, now) {
                    return Err(ScrapeError::CoolingDown {
                        remaining_secs: remaining.as_secs().max(1),
                    });
                }
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.tokens_per_second)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter: waiting for token");
            sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        if Self::cooldown_remaining(&mut state, now).is_some() {
            return false;
        }
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Refuse every acquire for `cooldown` and drain the bucket.
    pub fn block_for(&self, cooldown: Duration) {
        warn!(cooldown_secs = cooldown.as_secs(), "rate limiter: blocked, cooling down");
        let mut state = self.lock();
        let until = Instant::now() + cooldown;
        state.blocked_until = Some(state.blocked_until.map_or(until, |current| current.max(until)));
        state.tokens = 0.0;
    }

    #[cfg(test)]
    pub fn blocked_remaining(&self) -> Option<Duration> {
        let mut state = self.lock();
        Self::cooldown_remaining(&mut state, Instant::now())
    }

    #[cfg(test)]
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.tokens_per_second).min(self.bucket_size);
        state.last_refill = now;
    }

    fn cooldown_remaining(state: &mut BucketState, now: Instant) -> Option<Duration> {
        match state.blocked_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                state.blocked_until = None;
                state.last_refill = now;
                None
            }
            None => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
