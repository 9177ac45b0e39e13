//! Cross-Site Bandwidth Throttling
//!
//! Controls the rate at which batches are sent to each remote site,
//! preventing replication from consuming all available WAN bandwidth.
//! A sender that runs out of tokens suspends until the bucket refills.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Bandwidth limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Maximum bytes per second to send to one site (0 = unlimited).
    pub max_bytes_per_sec: u64,
    /// Maximum batches per second (0 = unlimited).
    pub max_batches_per_sec: u64,
    /// Burst allowance: multiplier on max rate for short bursts (e.g., 2.0 = 2x burst).
    pub burst_factor: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_sec: 100 * 1024 * 1024,
            max_batches_per_sec: 1_000,
            burst_factor: 1.5,
        }
    }
}

/// Tracks token bucket state for one throttle dimension.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket with the given capacity and refill rate (tokens/sec).
    pub fn new(capacity: u64, rate_per_sec: u64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            rate_per_sec: rate_per_sec as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Requests larger than the bucket are clamped to its capacity so they
    /// wait for a full bucket instead of forever.
    fn clamp(&self, amount: u64) -> f64 {
        (amount as f64).min(self.capacity)
    }

    /// Try to consume `amount` tokens. Refills first based on elapsed time.
    pub fn try_consume(&mut self, amount: u64, now: Instant) -> bool {
        self.refill(now);
        let amount = self.clamp(amount);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// How long until `amount` tokens are available.
    pub fn wait_time(&mut self, amount: u64, now: Instant) -> Duration {
        self.refill(now);
        let missing = self.clamp(amount) - self.tokens;
        if missing <= 0.0 || self.rate_per_sec <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.rate_per_sec)
        }
    }

    /// Returns current token count (floored).
    pub fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens.floor() as u64
    }
}

fn bucket_for(rate: u64, burst_factor: f64, now: Instant) -> Option<TokenBucket> {
    if rate == 0 {
        return None;
    }
    let capacity = ((rate as f64) * burst_factor).max(rate as f64) as u64;
    Some(TokenBucket::new(capacity, rate, now))
}

/// Per-site throttle: combines byte-rate and batch-rate token buckets.
#[derive(Debug)]
pub struct SiteThrottle {
    config: ThrottleConfig,
    bytes: Option<TokenBucket>,
    batches: Option<TokenBucket>,
}

impl SiteThrottle {
    /// Create a new site throttle with the given config.
    pub fn new(config: ThrottleConfig) -> Self {
        let now = Instant::now();
        Self {
            bytes: bucket_for(config.max_bytes_per_sec, config.burst_factor, now),
            batches: bucket_for(config.max_batches_per_sec, config.burst_factor, now),
            config,
        }
    }

    /// Current limits.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Consumes tokens for one batch of `byte_count` bytes if both buckets allow it.
    pub fn try_send(&mut self, byte_count: u64, now: Instant) -> bool {
        if !self.wait_time(byte_count, now).is_zero() {
            return false;
        }
        if let Some(bucket) = self.bytes.as_mut() {
            bucket.try_consume(byte_count, now);
        }
        if let Some(bucket) = self.batches.as_mut() {
            bucket.try_consume(1, now);
        }
        true
    }

    /// How long a batch of `byte_count` bytes must wait for tokens.
    pub fn wait_time(&mut self, byte_count: u64, now: Instant) -> Duration {
        let bytes = self
            .bytes
            .as_mut()
            .map_or(Duration::ZERO, |b| b.wait_time(byte_count, now));
        let batches = self
            .batches
            .as_mut()
            .map_or(Duration::ZERO, |b| b.wait_time(1, now));
        bytes.max(batches)
    }

    /// Suspends until one batch of `byte_count` bytes may be sent, then consumes its tokens.
    pub async fn acquire(&mut self, byte_count: u64) {
        loop {
            let now = Instant::now();
            if self.try_send(byte_count, now) {
                return;
            }
            let wait = self.wait_time(byte_count, now).max(Duration::from_millis(1));
            tracing::trace!(bytes = byte_count, wait_ms = wait.as_millis() as u64, "throttled");
            tokio::time::sleep(wait).await;
        }
    }

    /// Update the throttle config (e.g., admin changed bandwidth limit).
    pub fn update_config(&mut self, config: ThrottleConfig) {
        *self = Self::new(config);
    }
}
