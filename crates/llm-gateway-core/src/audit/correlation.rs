//! Correlation-id index and repeated-failure detection.

use super::event::{AuditEventType, AuditOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Sequences kept per correlation id.
const MAX_SEQUENCES_PER_ID: usize = 1024;
/// Detected anomalies kept for inspection.
const MAX_ANOMALIES: usize = 256;

/// Repeated failures of one kind under one correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub correlation_id: String,
    pub event_type: AuditEventType,
    pub failures: usize,
    pub window_secs: u64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Entry {
    sequences: VecDeque<u64>,
    failures: HashMap<AuditEventType, VecDeque<Duration>>,
}

#[derive(Debug)]
pub(crate) struct CorrelationIndex {
    window: Duration,
    threshold: usize,
    capacity: usize,
    entries: HashMap<String, Entry>,
    /// Insertion order, for evicting the oldest id at capacity.
    order: VecDeque<String>,
    anomalies: VecDeque<Anomaly>,
}

impl CorrelationIndex {
    pub fn new(window: Duration, threshold: usize, capacity: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            anomalies: VecDeque::new(),
        }
    }

    /// Index an event. Returns an anomaly when this event brings its
    /// (correlation id, type) failure count within the window to the threshold.
    pub fn observe(
        &mut self,
        correlation_id: &str,
        sequence: u64,
        event_type: AuditEventType,
        outcome: AuditOutcome,
        elapsed: Duration,
        now: DateTime<Utc>,
    ) -> Option<Anomaly> {
        if !self.entries.contains_key(correlation_id) {
            while self.entries.len() >= self.capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.order.push_back(correlation_id.to_string());
        }
        let entry = self.entries.entry(correlation_id.to_string()).or_default();

        entry.sequences.push_back(sequence);
        if entry.sequences.len() > MAX_SEQUENCES_PER_ID {
            entry.sequences.pop_front();
        }

        if !outcome.is_failure() || event_type == AuditEventType::AnomalyDetected {
            return None;
        }

        let window = self.window;
        let times = entry.failures.entry(event_type).or_default();
        times.push_back(elapsed);
        while let Some(&oldest) = times.front() {
            if elapsed.saturating_sub(oldest) > window {
                times.pop_front();
            } else {
                break;
            }
        }
        if times.len() < self.threshold {
            return None;
        }

        let failures = times.len();
        times.clear();
        let anomaly = Anomaly {
            correlation_id: correlation_id.to_string(),
            event_type,
            failures,
            window_secs: window.as_secs(),
            detected_at: now,
        };
        if self.anomalies.len() >= MAX_ANOMALIES {
            self.anomalies.pop_front();
        }
        self.anomalies.push_back(anomaly.clone());
        Some(anomaly)
    }

    pub fn sequences(&self, correlation_id: &str) -> Vec<u64> {
        self.entries
            .get(correlation_id)
            .map(|e| e.sequences.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
