//! Retry delay policies for failed keys.
//!
//! A [`RateLimiter`] decides how long a failed key waits before it is
//! handed to a worker again. Limiters are owned by the work queue and only
//! ever called under its lock, so they take `&mut self` and need no
//! synchronization of their own.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;

use crate::key::Key;

/// Default base delay for the per-key exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for the per-key exponential backoff.
///
/// 1000 s against a 5 ms base, as in the client-go default controller limiter,
/// rather than a fixed 1000x multiple of the base.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default growth factor between consecutive failures.
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// Default overall retry rate (tokens per second).
pub const DEFAULT_RETRY_QPS: f64 = 10.0;

/// Default overall retry burst.
pub const DEFAULT_RETRY_BURST: u32 = 100;

/// Computes retry delays per key.
pub trait RateLimiter: Send + Debug {
    /// Delay before `key` should be retried. Records one more failure.
    fn when(&mut self, key: &Key) -> Duration;

    /// Clear the failure history of `key`.
    fn forget(&mut self, key: &Key);

    /// Number of failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &Key) -> u32;
}

// =============================================================================
// Per-key exponential backoff
// =============================================================================

/// `min(base * factor^failures, max)` per key.
///
/// The curve is never reset except by [`RateLimiter::forget`].
#[derive(Debug, Clone)]
pub struct ItemExponentialBackoff {
    base: Duration,
    factor: u32,
    max: Duration,
    failures: HashMap<Key, u32>,
}

impl ItemExponentialBackoff {
    pub fn new(base: Duration, factor: u32, max: Duration) -> Self {
        Self {
            base,
            factor,
            max,
            failures: HashMap::new(),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.factor
            .checked_pow(attempt)
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter for ItemExponentialBackoff {
    fn when(&mut self, key: &Key) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let attempt = *failures;
        *failures = failures.saturating_add(1);
        self.delay_for(attempt)
    }

    fn forget(&mut self, key: &Key) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

// =============================================================================
// Overall token bucket
// =============================================================================

/// Token bucket shared by all keys.
///
/// Every call reserves one token; the returned delay is the time until that
/// token is available. Bounds the aggregate retry rate regardless of how
/// many distinct keys are failing.
#[derive(Debug, Clone)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.last = now;
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&mut self, _key: &Key) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }

        self.refill(Instant::now());
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // A tiny rate can push the wait past what a Duration holds.
            Duration::try_from_secs_f64(-self.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&mut self, _key: &Key) {}

    fn num_requeues(&self, _key: &Key) -> u32 {
        0
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Returns the longest delay of its members.
#[derive(Debug)]
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&mut self, key: &Key) -> Duration {
        // Every member must observe the failure, so no short-circuiting.
        self.limiters
            .iter_mut()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&mut self, key: &Key) {
        for limiter in &mut self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Growth factor between consecutive failures.
    pub backoff_factor: u32,

    /// Ceiling for the per-key delay.
    pub max_delay: Duration,

    /// Overall retry rate; zero or negative disables the bucket.
    pub qps: f64,

    /// Overall retry burst.
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_RETRY_QPS,
            burst: DEFAULT_RETRY_BURST,
        }
    }
}

impl RateLimiterConfig {
    /// Build the limiter described by this config.
    pub fn build(&self) -> Box<dyn RateLimiter> {
        let backoff =
            ItemExponentialBackoff::new(self.base_delay, self.backoff_factor, self.max_delay);

        if self.qps <= 0.0 {
            return Box::new(backoff);
        }

        Box::new(MaxOfRateLimiter::new(vec![
            Box::new(backoff),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ]))
    }
}

/// Per-key exponential backoff (5ms..1000s) combined with an overall
/// 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter() -> Box<dyn RateLimiter> {
    RateLimiterConfig::default().build()
}
