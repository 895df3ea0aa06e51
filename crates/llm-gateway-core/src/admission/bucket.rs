//! Token bucket driven by an externally supplied monotonic timestamp.

use std::time::Duration;

/// Token bucket state for one (identity, scope) pair.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Monotonic time of the last refill.
    last_refill: Duration,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, now: Duration) -> Self {
        Self {
            tokens: capacity,
            capacity,
            last_refill: now,
        }
    }

    /// Add `elapsed * rate` tokens, capped at capacity. A timestamp earlier
    /// than the last refill adds nothing.
    fn refill(&mut self, now: Duration, rate: f64) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Try to take `cost` tokens.
    ///
    /// On failure returns how long until `cost` tokens will be available at
    /// `rate`. Tokens are only deducted on success.
    pub fn try_consume(&mut self, cost: f64, now: Duration, rate: f64) -> Result<(), Duration> {
        self.refill(now, rate);

        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            let secs = if rate > 0.0 { deficit / rate } else { f64::MAX };
            Err(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        }
    }

    /// Tokens available at `now` (refills first).
    pub fn available(&mut self, now: Duration, rate: f64) -> f64 {
        self.refill(now, rate);
        self.tokens
    }

    /// Whether the bucket has refilled completely; idle full buckets can be
    /// dropped without changing behavior.
    pub fn is_full(&mut self, now: Duration, rate: f64) -> bool {
        self.available(now, rate) >= self.capacity
    }

    /// Apply a new capacity (scope config changes), clamping held tokens.
    pub fn set_capacity(&mut self, capacity: f64) {
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
    }
}
