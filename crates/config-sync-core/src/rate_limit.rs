//! Token-bucket limiter capping outbound call rates.
//!
//! Fetches and long polls each get their own limiter so that a mass restart of
//! clients cannot hammer the configuration service fleet.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Longest single sleep in [`RateLimiter::acquire`]; the bucket is re-checked afterwards.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Token bucket state.
#[derive(Debug)]
struct TokenBucket {
    /// Tokens added per second.
    rate: f64,
    /// Maximum number of stored tokens (burst).
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Takes a token, or returns how long until one is available.
    fn reserve(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - self.tokens;
            let wait = Duration::try_from_secs_f64(missing / self.rate).unwrap_or(MAX_WAIT);
            Some(wait.min(MAX_WAIT))
        }
    }
}

/// Async rate limiter; `None` rate means unlimited.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `qps` calls per second with a burst of `max(qps, 1)`.
    ///
    /// Non-positive or non-finite rates disable limiting.
    pub fn new(qps: f64) -> Self {
        if !qps.is_finite() || qps <= 0.0 {
            return Self::unlimited();
        }
        let capacity = qps.max(1.0);
        Self {
            bucket: Some(Mutex::new(TokenBucket {
                rate: qps,
                capacity,
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    #[cfg(test)]
    fn try_acquire(&self) -> bool {
        self.reserve().is_none()
    }

    /// Waits until a token is available.
    pub async fn acquire(&self) {
        while let Some(wait) = self.reserve() {
            sleep(wait).await;
        }
    }

    fn reserve(&self) -> Option<Duration> {
        let bucket = self.bucket.as_ref()?;
        let mut guard = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.reserve(Instant::now())
    }
}
