//! Admission control: token buckets, concurrency limits, suspicious-activity
//! blocking and per-provider circuit breakers.
//!
//! `check` never waits. Each identity owns a small mutex-protected state and a
//! semaphore; the identity directory is only write-locked when a new identity
//! is first seen.

mod adaptive;
mod breaker;
mod bucket;

pub use breaker::{BreakerError, CircuitState};

use crate::clock::SharedClock;
use crate::config::AdmissionConfig;
use adaptive::LatencyTracker;
use breaker::{CircuitBreaker, TrialGuard};
use bucket::TokenBucket;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Outcome of an admission check.
#[derive(Debug)]
pub enum AdmissionDecision {
    /// Request may proceed; holds a concurrency slot until dropped.
    Admitted(AdmissionPermit),
    /// Not enough tokens in the scope's bucket.
    RateLimited { retry_after: Duration, available: f64 },
    /// The identity already has `limit` requests in flight.
    ConcurrencyLimited { limit: usize },
    /// The identity is serving a suspicious-activity cooldown.
    Blocked { retry_after: Duration },
}

impl AdmissionDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionDecision::RateLimited { retry_after, .. }
            | AdmissionDecision::Blocked { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Fixed caller-facing reason for a rejection.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            AdmissionDecision::Admitted(_) => None,
            AdmissionDecision::RateLimited { .. } => Some("rate limited"),
            AdmissionDecision::ConcurrencyLimited { .. } => Some("concurrency limit exceeded"),
            AdmissionDecision::Blocked { .. } => Some("temporarily blocked"),
        }
    }

    pub fn into_permit(self) -> Option<AdmissionPermit> {
        match self {
            AdmissionDecision::Admitted(permit) => Some(permit),
            _ => None,
        }
    }
}

/// Concurrency slot held by an admitted request. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    identity: String,
    scope: String,
    in_flight: Arc<AtomicUsize>,
    _slot: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Admission counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmissionMetrics {
    pub admitted: u64,
    pub rate_limited: u64,
    pub concurrency_limited: u64,
    pub blocked_rejections: u64,
    pub identities_blocked: u64,
    pub in_flight: usize,
    pub tracked_identities: usize,
    pub open_circuits: usize,
    pub throttle_factor: f64,
    pub latency_ewma_ms: f64,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    concurrency_limited: AtomicU64,
    blocked_rejections: AtomicU64,
    identities_blocked: AtomicU64,
}

struct IdentityState {
    buckets: HashMap<String, TokenBucket>,
    /// Timestamps of recent rejections, oldest first.
    rejections: VecDeque<Duration>,
    blocked_until: Option<Duration>,
    last_seen: Duration,
}

struct IdentityEntry {
    state: Mutex<IdentityState>,
    slots: Arc<Semaphore>,
}

impl IdentityEntry {
    fn new(max_concurrent: usize, now: Duration) -> Self {
        Self {
            state: Mutex::new(IdentityState {
                buckets: HashMap::new(),
                rejections: VecDeque::new(),
                blocked_until: None,
                last_seen: now,
            }),
            slots: Arc::new(Semaphore::new(max_concurrent)),
        }
    }
}

/// Rate limiter, concurrency limiter and circuit breakers for the gateway.
pub struct AdmissionController {
    config: AdmissionConfig,
    clock: SharedClock,
    latency: Option<LatencyTracker>,
    identities: RwLock<HashMap<String, Arc<IdentityEntry>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    in_flight: Arc<AtomicUsize>,
    counters: Counters,
}

impl AdmissionController {
    /// `adaptive` enables latency-based refill throttling.
    pub fn new(config: AdmissionConfig, clock: SharedClock, adaptive: bool) -> Self {
        let latency = adaptive.then(|| {
            LatencyTracker::new(
                config.latency_ewma_alpha,
                config.latency_target(),
                config.min_throttle,
            )
        });
        Self {
            config,
            clock,
            latency,
            identities: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            counters: Counters::default(),
        }
    }

    /// Check whether `identifier` may spend `cost` tokens from `scope`.
    pub fn check(&self, identifier: &str, scope: &str, cost: f64) -> AdmissionDecision {
        let now = self.clock.elapsed();
        let entry = self.entry(identifier, now);
        let mut state = entry.state.lock();
        state.last_seen = now;

        if let Some(until) = state.blocked_until {
            if now < until {
                self.counters
                    .blocked_rejections
                    .fetch_add(1, Ordering::Relaxed);
                return AdmissionDecision::Blocked {
                    retry_after: until - now,
                };
            }
            state.blocked_until = None;
            state.rejections.clear();
        }

        let slot = match entry.slots.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                self.counters
                    .concurrency_limited
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_admission_rejected_total", "reason" => "concurrency")
                    .increment(1);
                self.note_rejection(&mut state, identifier, now);
                return AdmissionDecision::ConcurrencyLimited {
                    limit: self.config.max_concurrent,
                };
            }
        };

        let limit = self.config.limit_for(scope);
        let rate = limit.refill_per_sec * self.throttle_factor();
        let bucket = state
            .buckets
            .entry(scope.to_string())
            .or_insert_with(|| TokenBucket::new(limit.burst, now));
        bucket.set_capacity(limit.burst);

        match bucket.try_consume(cost.max(0.0), now, rate) {
            Ok(()) => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                AdmissionDecision::Admitted(AdmissionPermit {
                    identity: identifier.to_string(),
                    scope: scope.to_string(),
                    in_flight: Arc::clone(&self.in_flight),
                    _slot: slot,
                })
            }
            Err(retry_after) => {
                let available = bucket.available(now, rate);
                drop(slot);
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_admission_rejected_total", "reason" => "rate")
                    .increment(1);
                self.note_rejection(&mut state, identifier, now);
                AdmissionDecision::RateLimited {
                    retry_after,
                    available,
                }
            }
        }
    }

    /// Return a concurrency slot. Equivalent to dropping the permit.
    pub fn release(&self, permit: AdmissionPermit) {
        drop(permit);
    }

    /// Remaining cooldown if `identifier` is currently blocked.
    pub fn blocked_for(&self, identifier: &str) -> Option<Duration> {
        let now = self.clock.elapsed();
        let entry = self.identities.read().get(identifier).cloned()?;
        let state = entry.state.lock();
        state
            .blocked_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// Run `call` through the breaker for `provider`.
    ///
    /// Success and failure of the returned result drive the breaker. If the
    /// future is dropped while it is the half-open trial, the trial slot is
    /// released for the next caller.
    pub async fn call_through_breaker<T, E, F>(
        &self,
        provider: &str,
        call: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(provider);
        let admit = breaker
            .try_acquire(self.clock.elapsed())
            .map_err(|retry_after| BreakerError::Open { retry_after })?;

        let guard = TrialGuard::new(&breaker, admit);
        let result = call.await;
        guard.disarm();

        match &result {
            Ok(_) => breaker.on_success(admit),
            Err(_) => {
                if breaker.on_failure(admit, self.clock.elapsed()) {
                    tracing::warn!(provider = %provider, "circuit opened");
                    metrics::counter!("gateway_circuit_opened_total").increment(1);
                }
            }
        }
        result.map_err(BreakerError::Inner)
    }

    /// Remaining open time for `provider` without consuming a trial.
    pub fn probe_circuit(&self, provider: &str) -> Option<Duration> {
        let breaker = self.breakers.read().get(provider).cloned()?;
        breaker.probe(self.clock.elapsed())
    }

    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.breakers
            .read()
            .get(provider)
            .map_or(CircuitState::Closed, |b| b.state(self.clock.elapsed()))
    }

    /// Feed a completed provider call's latency into adaptive throttling.
    pub fn record_latency(&self, latency: Duration) {
        if let Some(tracker) = &self.latency {
            tracker.record(latency);
        }
    }

    /// Current refill multiplier (1.0 when adaptive throttling is off).
    pub fn throttle_factor(&self) -> f64 {
        self.latency.as_ref().map_or(1.0, LatencyTracker::factor)
    }

    /// Drop identities idle for longer than `idle` that hold no slots, are
    /// not blocked and whose buckets have refilled. Returns how many were
    /// removed.
    pub fn cleanup_idle(&self, idle: Duration) -> usize {
        let now = self.clock.elapsed();
        let max = self.config.max_concurrent;
        let factor = self.throttle_factor();
        let mut identities = self.identities.write();
        let before = identities.len();
        identities.retain(|_, entry| {
            let mut state = entry.state.lock();
            let blocked = state.blocked_until.map_or(false, |until| now < until);
            let busy = entry.slots.available_permits() < max;
            let fresh = now.saturating_sub(state.last_seen) < idle;
            // A fresh entry would start with a full burst.
            let draining = state.buckets.iter_mut().any(|(scope, bucket)| {
                !bucket.is_full(now, self.config.limit_for(scope).refill_per_sec * factor)
            });
            blocked || busy || fresh || draining
        });
        before - identities.len()
    }

    pub fn metrics(&self) -> AdmissionMetrics {
        let now = self.clock.elapsed();
        let open_circuits = self
            .breakers
            .read()
            .values()
            .filter(|b| b.state(now) != CircuitState::Closed)
            .count();
        AdmissionMetrics {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            concurrency_limited: self.counters.concurrency_limited.load(Ordering::Relaxed),
            blocked_rejections: self.counters.blocked_rejections.load(Ordering::Relaxed),
            identities_blocked: self.counters.identities_blocked.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            tracked_identities: self.identities.read().len(),
            open_circuits,
            throttle_factor: self.throttle_factor(),
            latency_ewma_ms: self.latency.as_ref().map_or(0.0, LatencyTracker::ewma_ms),
        }
    }

    fn entry(&self, identifier: &str, now: Duration) -> Arc<IdentityEntry> {
        if let Some(entry) = self.identities.read().get(identifier) {
            return Arc::clone(entry);
        }
        let mut identities = self.identities.write();
        Arc::clone(
            identities
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(IdentityEntry::new(self.config.max_concurrent, now))),
        )
    }

    fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(provider) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(provider.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                self.config.breaker_failure_threshold,
                self.config.breaker_recovery(),
            ))
        }))
    }

    /// Record a rejection and block the identity once the window fills.
    fn note_rejection(&self, state: &mut IdentityState, identifier: &str, now: Duration) {
        let window = self.config.suspicion_window();
        while let Some(&oldest) = state.rejections.front() {
            if now.saturating_sub(oldest) > window {
                state.rejections.pop_front();
            } else {
                break;
            }
        }
        state.rejections.push_back(now);

        if state.rejections.len() >= self.config.suspicion_threshold as usize {
            state.blocked_until = Some(now + self.config.block_cooldown());
            state.rejections.clear();
            self.counters
                .identities_blocked
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_identities_blocked_total").increment(1);
            tracing::warn!(
                identity = %crate::audit::mask_identity(identifier),
                cooldown_secs = self.config.block_cooldown_secs,
                "identity temporarily blocked after repeated rejections"
            );
        }
    }
}
