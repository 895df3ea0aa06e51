//! Latency-driven refill throttling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Exponentially weighted moving average of provider latency.
///
/// The average is kept as `f64` bits in an `AtomicU64` and updated with a
/// compare-and-swap loop, so recording never blocks admission checks.
#[derive(Debug)]
pub(crate) struct LatencyTracker {
    ewma_ms: AtomicU64,
    samples: AtomicU64,
    alpha: f64,
    target_ms: f64,
    min_factor: f64,
}

impl LatencyTracker {
    pub fn new(alpha: f64, target: Duration, min_factor: f64) -> Self {
        Self {
            ewma_ms: AtomicU64::new(0f64.to_bits()),
            samples: AtomicU64::new(0),
            alpha,
            target_ms: target.as_secs_f64() * 1000.0,
            min_factor,
        }
    }

    pub fn record(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        let first = self.samples.fetch_add(1, Ordering::AcqRel) == 0;

        let mut current = self.ewma_ms.load(Ordering::Acquire);
        loop {
            let prev = f64::from_bits(current);
            let next = if first {
                sample
            } else {
                self.alpha * sample + (1.0 - self.alpha) * prev
            };
            match self.ewma_ms.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn ewma_ms(&self) -> f64 {
        f64::from_bits(self.ewma_ms.load(Ordering::Acquire))
    }

    /// Multiplier in `[min_factor, 1]` applied to token refill rates.
    pub fn factor(&self) -> f64 {
        let ewma = self.ewma_ms();
        if ewma <= self.target_ms || ewma <= 0.0 {
            1.0
        } else {
            (self.target_ms / ewma).max(self.min_factor)
        }
    }
}
