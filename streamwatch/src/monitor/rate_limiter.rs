//! Client-side rate limiting for status API calls.
//!
//! A token bucket shared by every batch request, so concurrent batches stay
//! inside the platform's request budget before the server has to push back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

/// Configuration for a rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum tokens (burst capacity).
    pub max_tokens: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Initial tokens.
    pub initial_tokens: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_rate: 1.0,
            initial_tokens: 10,
        }
    }
}

impl RateLimiterConfig {
    /// Create a config for a requests-per-second limit, with a 2x burst.
    pub fn with_rps(rps: f64) -> crate::Result<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return Err(crate::Error::config(format!(
                "rate limit must be a positive finite number, got {}",
                rps
            )));
        }

        let max_tokens = (rps * 2.0).ceil().max(1.0) as u32;

        Ok(Self {
            max_tokens,
            refill_rate: rps,
            initial_tokens: max_tokens,
        })
    }

    /// Create a config for a requests-per-minute budget.
    ///
    /// The burst is capped at one second's worth of requests so a full cycle
    /// cannot spend a minute's budget at once.
    pub fn per_minute(requests_per_minute: u32) -> crate::Result<Self> {
        let rps = f64::from(requests_per_minute) / 60.0;
        let mut config = Self::with_rps(rps)?;
        config.max_tokens = rps.ceil().max(1.0) as u32;
        config.initial_tokens = config.max_tokens;
        Ok(config)
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: u32,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            tokens: f64::from(config.initial_tokens),
            max_tokens: config.max_tokens,
            refill_rate: config.refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let new_tokens = elapsed.as_secs_f64() * self.refill_rate;

        self.tokens = (self.tokens + new_tokens).min(f64::from(self.max_tokens));
        self.last_refill = now;
    }
}

/// Shared token bucket. Clones draw from the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(&config))),
        }
    }

    /// Try to take a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.try_acquire()
    }

    /// Take a token, waiting if necessary. Returns the time spent waiting.
    ///
    /// # Cancel Safety
    ///
    /// The lock is released before sleeping, so dropping this future consumes
    /// no token and leaves the bucket usable.
    pub async fn acquire(&self) -> Duration {
        let mut total_wait = Duration::ZERO;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_acquire() {
                    return total_wait;
                }
                bucket.time_until_available()
            };

            trace!(wait = ?wait, "rate limited");
            tokio::time::sleep(wait).await;
            total_wait += wait;
        }
    }

    /// Tokens currently available.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.tokens
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
