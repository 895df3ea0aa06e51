//! Per-provider circuit breaker.
//!
//! Closed until `failure_threshold` consecutive failures, then Open for the
//! recovery window. After the window exactly one trial call is let through
//! (HalfOpen); its outcome closes or re-opens the circuit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the recovery window elapses.
    Open,
    /// One trial call decides whether to close again.
    HalfOpen,
}

/// Error from a call made through a breaker.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the provider.
    #[error("circuit open, retry after {retry_after:?}")]
    Open { retry_after: Duration },
    /// The provider call itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// What kind of call the breaker admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admit {
    Normal,
    Trial,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Duration,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    recovery: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: Duration::ZERO,
                trial_in_flight: false,
            }),
            failure_threshold,
            recovery,
        }
    }

    /// Admit a call or return how long until one could be admitted.
    pub fn try_acquire(&self, now: Duration) -> Result<Admit, Duration> {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => Ok(Admit::Normal),
            CircuitState::Open => {
                let since = now.saturating_sub(s.opened_at);
                if since >= self.recovery {
                    s.state = CircuitState::HalfOpen;
                    s.trial_in_flight = true;
                    Ok(Admit::Trial)
                } else {
                    Err(self.recovery - since)
                }
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    Err(self.recovery)
                } else {
                    s.trial_in_flight = true;
                    Ok(Admit::Trial)
                }
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire) but without changing state.
    pub fn probe(&self, now: Duration) -> Option<Duration> {
        let s = self.state.lock();
        match s.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let since = now.saturating_sub(s.opened_at);
                (since < self.recovery).then(|| self.recovery - since)
            }
            CircuitState::HalfOpen => s.trial_in_flight.then_some(self.recovery),
        }
    }

    pub fn on_success(&self, admit: Admit) {
        let mut s = self.state.lock();
        match (s.state, admit) {
            (CircuitState::HalfOpen, Admit::Trial) => {
                s.state = CircuitState::Closed;
                s.consecutive_failures = 0;
                s.trial_in_flight = false;
                tracing::info!("circuit closed after successful trial");
            }
            (CircuitState::Closed, _) => s.consecutive_failures = 0,
            // Late result from a call admitted before the circuit opened.
            _ => {}
        }
    }

    /// Returns true when this failure opened the circuit.
    pub fn on_failure(&self, admit: Admit, now: Duration) -> bool {
        let mut s = self.state.lock();
        match (s.state, admit) {
            (CircuitState::HalfOpen, Admit::Trial) => {
                s.state = CircuitState::Open;
                s.opened_at = now;
                s.trial_in_flight = false;
                true
            }
            (CircuitState::Closed, _) => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.failure_threshold {
                    s.state = CircuitState::Open;
                    s.opened_at = now;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// A trial call was cancelled before it finished; let another one try.
    pub fn abandon_trial(&self) {
        let mut s = self.state.lock();
        if s.state == CircuitState::HalfOpen {
            s.trial_in_flight = false;
        }
    }

    /// Reported state; an Open circuit whose window has elapsed reads as
    /// HalfOpen.
    pub fn state(&self, now: Duration) -> CircuitState {
        let s = self.state.lock();
        match s.state {
            CircuitState::Open if now.saturating_sub(s.opened_at) >= self.recovery => {
                CircuitState::HalfOpen
            }
            other => other,
        }
    }
}

/// Resets the half-open trial if the guarded call is dropped mid-flight.
pub(crate) struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    admit: Admit,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    pub fn new(breaker: &'a CircuitBreaker, admit: Admit) -> Self {
        Self {
            breaker,
            admit,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.admit == Admit::Trial {
            self.breaker.abandon_trial();
        }
    }
}
