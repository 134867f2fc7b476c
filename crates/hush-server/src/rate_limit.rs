//! Rate limiting.
//!
//! Two limiters with different shapes:
//!
//! - [`AuthRateLimiter`]: token bucket per source address, consulted before
//!   the defense engine so a flood of attempts cannot even reach the failure
//!   counter faster than the refill rate.
//! - [`SendWindow`]: sliding window per connection for relay sends.
//!
//! Both are generic over the instant type so tests can drive them with
//! scripted time.

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    ops::Sub,
    time::Duration,
};

use hush_proto::limits::{MAX_SENDS_PER_WINDOW, SEND_RATE_WINDOW};

/// Authentication attempts refilled per minute.
pub const AUTH_ATTEMPTS_PER_MINUTE: u32 = 10;

/// Authentication attempts that may be made back to back.
pub const AUTH_BURST: u32 = 3;

/// Token bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum stored tokens
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: f64::from(AUTH_BURST),
            refill_per_sec: f64::from(AUTH_ATTEMPTS_PER_MINUTE) / 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket<I> {
    tokens: f64,
    updated: I,
}

/// Per-address token bucket for authentication attempts.
#[derive(Debug, Clone)]
pub struct AuthRateLimiter<I> {
    config: BucketConfig,
    buckets: HashMap<IpAddr, Bucket<I>>,
}

impl<I> AuthRateLimiter<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a limiter.
    pub fn new(config: BucketConfig) -> Self {
        Self { config, buckets: HashMap::new() }
    }

    /// Take one token for `addr`.
    ///
    /// Returns the time until a token is available when the bucket is empty.
    pub fn check(&mut self, addr: IpAddr, now: I) -> Result<(), Duration> {
        let config = self.config;
        let bucket =
            self.buckets.entry(addr).or_insert(Bucket { tokens: config.capacity, updated: now });

        if now > bucket.updated {
            let elapsed = (now - bucket.updated).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * config.refill_per_sec).min(config.capacity);
            bucket.updated = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        Err(Duration::from_secs_f64(missing / config.refill_per_sec.max(f64::EPSILON)))
    }

    /// Drop buckets that would be full by now.
    pub fn prune(&mut self, now: I) {
        let config = self.config;
        self.buckets.retain(|_, bucket| {
            let elapsed =
                if now > bucket.updated { (now - bucket.updated).as_secs_f64() } else { 0.0 };
            bucket.tokens + elapsed * config.refill_per_sec < config.capacity
        });
    }

    /// Number of tracked addresses.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

/// Sliding-window limit on sends from one connection.
#[derive(Debug, Clone)]
pub struct SendWindow<I> {
    max: usize,
    window: Duration,
    sent: VecDeque<I>,
}

impl<I> Default for SendWindow<I> {
    fn default() -> Self {
        Self { max: MAX_SENDS_PER_WINDOW, window: SEND_RATE_WINDOW, sent: VecDeque::new() }
    }
}

impl<I> SendWindow<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Window admitting `max` sends per `window`.
    pub fn new(max: usize, window: Duration) -> Self {
        Self { max, window, sent: VecDeque::with_capacity(max) }
    }

    /// Record a send at `now` if the window has room.
    ///
    /// Returns the time until the oldest send leaves the window otherwise.
    pub fn try_acquire(&mut self, now: I) -> Result<(), Duration> {
        while let Some(&oldest) = self.sent.front() {
            if now >= oldest && now - oldest >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }

        if self.sent.len() < self.max {
            self.sent.push_back(now);
            return Ok(());
        }

        let oldest = self.sent.front().copied().unwrap_or(now);
        let age = if now > oldest { now - oldest } else { Duration::ZERO };
        Err(self.window.saturating_sub(age))
    }
}
