//! Tamper-evident audit ledger.
//!
//! Every event is PII-masked, sequenced and linked into a SHA-256 hash chain
//! starting at [`GENESIS_HASH_V1`]. Events are buffered and written to an
//! [`AuditStore`] in batches. A full batch triggers a single write attempt,
//! while events of severity `Error` or above force a flush with retries.
//!
//! The chain lock only covers sequence assignment and linking. Body digests
//! are computed before it is taken and storage writes happen after it is
//! released, serialized by a separate flush lock so batches land in order.

mod checkpoint;
mod correlation;
mod event;
mod pii;
mod store;

pub use checkpoint::Checkpoint;
pub use correlation::Anomaly;
pub use event::{
    AuditEvent, AuditEventType, AuditOutcome, AuditRecord, Severity, GENESIS_HASH_V1,
};
pub use pii::{mask_identity, PiiKind, PiiMasker};
pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore, PurgeSummary};

use crate::clock::SharedClock;
use crate::config::{AuditConfig, Capabilities};
use crate::error::GatewayError;
use crate::keys::{SigningKey, CHECKPOINT_LABEL};
use chrono::{DateTime, Utc};
use correlation::CorrelationIndex;
use event::{chain_hash, format_sequences, parse_sequences};
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Range, RangeInclusive};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Metadata key under which `SUBJECT_ERASED` lists its sequences.
const ERASED_SEQUENCES: &str = "sequences";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueKind {
    /// Stored hash does not match the event's content.
    HashMismatch,
    /// `previous_hash` does not match the preceding event.
    BrokenLink,
    /// Sequence numbers are missing.
    SequenceGap,
    /// A checkpoint's signature does not verify.
    CheckpointSignature,
    /// A checkpoint disagrees with the stored chain.
    CheckpointMismatch,
    /// Events were removed without a checkpoint to anchor what remains.
    MissingAnchor,
    /// A tombstone still holds content or lacks its sealed digest.
    MalformedTombstone,
    /// A tombstone no later `SUBJECT_ERASED` event accounts for.
    UnrecordedErasure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub sequence: u64,
    pub kind: IntegrityIssueKind,
    pub detail: String,
}

/// Result of [`AuditLedger::verify_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    /// Events walked, including any needed to reach the requested range.
    pub checked: usize,
    /// Tombstones seen; their header and sealed digest are checked.
    pub tombstones: usize,
    /// Checkpoint the walk started from, or `None` for genesis.
    pub anchor: Option<u64>,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    fn empty() -> Self {
        Self {
            valid: true,
            checked: 0,
            tombstones: 0,
            anchor: None,
            issues: Vec::new(),
        }
    }

    fn issue(&mut self, sequence: u64, kind: IntegrityIssueKind, detail: impl Into<String>) {
        self.issues.push(IntegrityIssue {
            sequence,
            kind,
            detail: detail.into(),
        });
    }
}

/// Everything the ledger holds about one data subject.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectExport {
    pub subject_key: String,
    pub exported_at: DateTime<Utc>,
    pub events: Vec<AuditEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditMetrics {
    pub events_appended: u64,
    pub events_flushed: u64,
    pub flush_failures: u64,
    pub checkpoints_written: u64,
    pub anomalies_detected: u64,
    pub subjects_erased: u64,
    pub events_purged: u64,
    pub buffered: usize,
    pub next_sequence: u64,
    pub tracked_correlations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    appended: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
    checkpoints: AtomicU64,
    anomalies: AtomicU64,
    erased: AtomicU64,
    purged: AtomicU64,
}

#[derive(Debug)]
struct ChainState {
    next_sequence: u64,
    last_hash: String,
    buffer: Vec<AuditEvent>,
    pending_checkpoints: Vec<Checkpoint>,
}

/// Append-only, hash-chained audit log.
#[derive(Debug)]
pub struct AuditLedger {
    config: AuditConfig,
    checkpoints_enabled: bool,
    store: Arc<dyn AuditStore>,
    clock: SharedClock,
    masker: Option<PiiMasker>,
    checkpoint_key: SigningKey,
    chain: Mutex<ChainState>,
    flush_lock: tokio::sync::Mutex<()>,
    correlation: Option<Mutex<CorrelationIndex>>,
    counters: Counters,
}

impl AuditLedger {
    /// Open a ledger over `store`, continuing the chain from its tail.
    pub async fn open(
        config: AuditConfig,
        capabilities: &Capabilities,
        signing_secret: &str,
        store: Arc<dyn AuditStore>,
        clock: SharedClock,
    ) -> Result<Self, GatewayError> {
        let checkpoint_key = SigningKey::derive(signing_secret, CHECKPOINT_LABEL);
        let anchor = store
            .checkpoints()
            .await?
            .into_iter()
            .rev()
            .find(|c| c.is_authentic(&checkpoint_key));

        let (next_sequence, last_hash) = match (store.tail().await?, anchor) {
            (Some(tail), _) if tail.compute_hash() != tail.self_hash => {
                return Err(GatewayError::IntegrityViolation(format!(
                    "stored tail {} does not match its hash",
                    tail.sequence
                )));
            }
            (Some(tail), Some(anchor)) if anchor.sequence > tail.sequence => {
                return Err(GatewayError::IntegrityViolation(format!(
                    "checkpoint {} is ahead of stored tail {}",
                    anchor.sequence, tail.sequence
                )));
            }
            (Some(tail), _) => (tail.sequence + 1, tail.self_hash),
            // A fully purged store still has its anchor checkpoint.
            (None, Some(anchor)) => (anchor.sequence + 1, anchor.chain_hash),
            (None, None) => (0, GENESIS_HASH_V1.to_string()),
        };
        if next_sequence > 0 {
            info!(next_sequence, "resuming audit chain");
        }

        let correlation = capabilities.correlation.then(|| {
            Mutex::new(CorrelationIndex::new(
                config.correlation_window(),
                config.correlation_failure_threshold,
                config.correlation_capacity,
            ))
        });

        Ok(Self {
            checkpoints_enabled: capabilities.checkpoints && config.checkpoint_interval > 0,
            store,
            clock,
            masker: capabilities
                .pii_masking
                .then(|| PiiMasker::new(signing_secret)),
            checkpoint_key,
            chain: Mutex::new(ChainState {
                next_sequence,
                last_hash,
                buffer: Vec::new(),
                pending_checkpoints: Vec::new(),
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            correlation,
            counters: Counters::default(),
            config,
        })
    }

    /// Record an event and return its id.
    ///
    /// Only flush-forcing severities can fail here, after their retries are
    /// exhausted; the event then stays queued for the next flush.
    pub async fn append(&self, record: AuditRecord) -> Result<String, GatewayError> {
        let forced = record.severity.forces_flush();
        let (event_id, batch_full) = self.record(record);

        if forced {
            self.flush().await?;
        } else if batch_full {
            let _guard = self.flush_lock.lock().await;
            if let Err(e) = self.drain(0).await {
                warn!(error = %e, "audit batch flush failed; will retry on next flush");
            }
        }
        Ok(event_id)
    }

    /// Key under which events about `identity` are stored.
    pub fn subject_key(&self, identity: &str) -> String {
        match &self.masker {
            Some(masker) => masker.pseudonymize(identity),
            None => identity.to_string(),
        }
    }

    /// Mask, sequence, link and buffer one event.
    fn record(&self, record: AuditRecord) -> (String, bool) {
        let mut event = self.prepare(record);
        let digest = event.body_digest();
        let event_id = event.event_id.clone();
        let event_type = event.event_type;
        let outcome = event.outcome;
        let correlation_id = event.correlation_id.clone();

        let (sequence, mut batch_full) = {
            let mut chain = self.chain.lock();
            let sequence = chain.next_sequence;
            event.sequence = sequence;
            event.previous_hash = std::mem::take(&mut chain.last_hash);
            event.self_hash = chain_hash(&digest, sequence, &event.previous_hash);
            chain.last_hash = event.self_hash.clone();
            chain.next_sequence += 1;

            if self.checkpoints_enabled && (sequence + 1) % self.config.checkpoint_interval == 0 {
                let checkpoint = Checkpoint::sign(
                    &self.checkpoint_key,
                    sequence,
                    event.self_hash.clone(),
                    event.timestamp,
                );
                chain.pending_checkpoints.push(checkpoint);
            }

            chain.buffer.push(event);
            (sequence, chain.buffer.len() >= self.config.batch_size)
        };

        self.counters.appended.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_audit_events_total", "type" => event_type.as_str())
            .increment(1);

        let anomaly = match (&self.correlation, correlation_id) {
            (Some(index), Some(id)) => index.lock().observe(
                &id,
                sequence,
                event_type,
                outcome,
                self.clock.elapsed(),
                self.clock.now(),
            ),
            _ => None,
        };
        if let Some(anomaly) = anomaly {
            self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_audit_anomalies_total").increment(1);
            warn!(
                correlation_id = %anomaly.correlation_id,
                event_type = %anomaly.event_type,
                failures = anomaly.failures,
                "repeated failures under one correlation id"
            );
            // Anomaly events are never counted by the index, so this recursion is one level deep.
            let (_, full) = self.record(
                AuditRecord::new(AuditEventType::AnomalyDetected, AuditOutcome::Failure)
                    .correlation_id(Some(&anomaly.correlation_id))
                    .meta("failed_event_type", anomaly.event_type)
                    .meta("failures", anomaly.failures)
                    .meta("window_secs", anomaly.window_secs),
            );
            batch_full |= full;
        }

        (event_id, batch_full)
    }

    fn prepare(&self, record: AuditRecord) -> AuditEvent {
        let mask = |value: String| match &self.masker {
            Some(masker) => masker.mask_text(&value),
            None => value,
        };
        let erasure = record.event_type == AuditEventType::SubjectErased;
        AuditEvent {
            sequence: 0,
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            event_type: record.event_type,
            severity: record.severity,
            outcome: record.outcome,
            actor: record.actor.map(|a| self.subject_key(&a)),
            subject_key: record.subject.map(|s| self.subject_key(&s)),
            target: record.target.map(mask),
            correlation_id: record.correlation_id,
            ip_address: record.ip_address.map(mask),
            metadata: record
                .metadata
                .into_iter()
                .map(|(k, v)| {
                    // Erased sequence lists are bookkeeping, not free text.
                    if erasure && k == ERASED_SEQUENCES {
                        (k, v)
                    } else {
                        (k, mask(v))
                    }
                })
                .collect(),
            previous_hash: String::new(),
            self_hash: String::new(),
            tombstone: false,
            sealed_content: None,
        }
    }

    /// Write every buffered event, retrying with exponential backoff.
    pub async fn flush(&self) -> Result<usize, GatewayError> {
        let _guard = self.flush_lock.lock().await;
        self.drain(self.config.flush_retries).await
    }

    /// Flush and log the outcome; called when the gateway shuts down.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let flushed = self.flush().await?;
        info!(flushed, "audit ledger flushed for shutdown");
        Ok(())
    }

    /// Caller must hold `flush_lock`.
    ///
    /// Writes a copy of the buffer and removes events only once the store
    /// has them, so a cancelled drain leaves everything queued. Stores skip
    /// sequences they already hold, which makes the rewrite harmless.
    async fn drain(&self, retries: u32) -> Result<usize, GatewayError> {
        let (batch, checkpoints) = {
            let chain = self.chain.lock();
            (chain.buffer.clone(), chain.pending_checkpoints.clone())
        };
        if batch.is_empty() && checkpoints.is_empty() {
            return Ok(0);
        }

        let mut attempt = 0u32;
        loop {
            match self.store.append_batch(&batch).await {
                Ok(()) => break,
                Err(e) if attempt < retries => {
                    attempt += 1;
                    let backoff = self.config.flush_backoff() * 2u32.saturating_pow(attempt - 1);
                    warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "audit flush failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_audit_flush_failures_total").increment(1);
                    error!(error = %e, buffered = batch.len(), "audit flush failed; batch stays queued");
                    return Err(e);
                }
            }
        }
        // Only `record` touches the buffer outside this lock, and only at the back.
        self.chain.lock().buffer.drain(..batch.len());

        // Checkpoints go out only once the events they cover are stored.
        for checkpoint in &checkpoints {
            if let Err(e) = self.store.put_checkpoint(checkpoint).await {
                warn!(sequence = checkpoint.sequence, error = %e, "checkpoint write failed; kept queued");
                break;
            }
            self.chain.lock().pending_checkpoints.remove(0);
            self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        }

        let flushed = batch.len();
        self.counters
            .flushed
            .fetch_add(flushed as u64, Ordering::Relaxed);
        debug!(events = flushed, "audit batch flushed");
        Ok(flushed)
    }

    /// Recompute the chain over `range` of sequences.
    ///
    /// The walk starts at the nearest authentic checkpoint below the range,
    /// or at genesis. A failed verification is itself recorded as a
    /// critical `INTEGRITY_VIOLATION` event.
    pub async fn verify_integrity(&self, range: Range<u64>) -> Result<IntegrityReport, GatewayError> {
        self.flush().await?;
        let report = self.walk_chain(range.clone()).await?;

        if !report.valid {
            error!(
                issues = report.issues.len(),
                first = report.issues.first().map(|i| i.sequence),
                "audit chain integrity violation"
            );
            metrics::counter!("gateway_audit_integrity_violations_total").increment(1);
            let first = &report.issues[0];
            let alert = AuditRecord::new(AuditEventType::IntegrityViolation, AuditOutcome::Failure)
                .meta("range", format!("{}..{}", range.start, range.end))
                .meta("issues", report.issues.len())
                .meta("first_sequence", first.sequence)
                .meta("first_kind", format!("{:?}", first.kind));
            if let Err(e) = self.append(alert).await {
                error!(error = %e, "failed to record integrity violation");
            }
        }
        Ok(report)
    }

    /// Verify the whole stored chain.
    pub async fn verify_all(&self) -> Result<IntegrityReport, GatewayError> {
        self.verify_integrity(0..u64::MAX).await
    }

    async fn walk_chain(&self, range: Range<u64>) -> Result<IntegrityReport, GatewayError> {
        use IntegrityIssueKind::*;

        let mut report = IntegrityReport::empty();
        let Some((first, last)) = self.store.bounds().await? else {
            return Ok(report);
        };
        let start = range.start.max(first);
        let end = range.end.min(last.saturating_add(1));
        if start >= end {
            return Ok(report);
        }

        let mut trusted = Vec::new();
        for checkpoint in self.store.checkpoints().await? {
            if checkpoint.is_authentic(&self.checkpoint_key) {
                trusted.push(checkpoint);
            } else {
                report.issue(
                    checkpoint.sequence,
                    CheckpointSignature,
                    "checkpoint signature does not verify",
                );
            }
        }

        // Nearest trusted checkpoint below the range that still borders stored events.
        let anchor = trusted
            .iter()
            .filter(|c| c.sequence < start && c.sequence + 1 >= first)
            .max_by_key(|c| c.sequence);
        let (from, mut expected_prev) = match anchor {
            Some(c) => {
                report.anchor = Some(c.sequence);
                (c.sequence + 1, Some(c.chain_hash.clone()))
            }
            None if first == 0 => (0, Some(GENESIS_HASH_V1.to_string())),
            None => {
                report.issue(
                    first,
                    MissingAnchor,
                    format!("events before {} removed without a checkpoint", first),
                );
                (first, None)
            }
        };

        let events = self.store.load_range(from..end).await?;
        let mut expected_seq = from;
        let mut tombstones = Vec::new();
        let mut erasures: Vec<(u64, Vec<RangeInclusive<u64>>)> = Vec::new();
        for event in &events {
            if event.sequence != expected_seq {
                report.issue(
                    expected_seq,
                    SequenceGap,
                    format!("missing sequences {}..{}", expected_seq, event.sequence),
                );
            }
            if let Some(prev) = &expected_prev {
                if &event.previous_hash != prev {
                    report.issue(event.sequence, BrokenLink, "previous_hash does not match chain");
                }
            }
            if event.tombstone {
                report.tombstones += 1;
                tombstones.push(event.sequence);
            }
            if event.tombstone && !event.is_sealed_tombstone() {
                report.issue(event.sequence, MalformedTombstone, "tombstone is not sealed");
            } else if event.compute_hash() != event.self_hash {
                report.issue(event.sequence, HashMismatch, "content does not match stored hash");
            } else if let Some(erased) = erased_sequences(event) {
                erasures.push((event.sequence, erased));
            }
            expected_prev = Some(event.self_hash.clone());
            expected_seq = event.sequence + 1;
            report.checked += 1;
        }
        if expected_seq < end {
            report.issue(
                expected_seq,
                SequenceGap,
                format!("missing sequences {}..{}", expected_seq, end),
            );
        }

        if !tombstones.is_empty() {
            // Erasure records are written after what they erase, possibly past the range.
            if end <= last {
                for event in self.store.load_range(end..last.saturating_add(1)).await? {
                    if event.compute_hash() == event.self_hash {
                        if let Some(erased) = erased_sequences(&event) {
                            erasures.push((event.sequence, erased));
                        }
                    }
                }
            }
            for sequence in tombstones {
                let covered = erasures.iter().any(|(at, ranges)| {
                    *at > sequence && ranges.iter().any(|r| r.contains(&sequence))
                });
                if !covered {
                    report.issue(
                        sequence,
                        UnrecordedErasure,
                        "tombstone without a SUBJECT_ERASED record",
                    );
                }
            }
        }

        for checkpoint in trusted.iter().filter(|c| (from..end).contains(&c.sequence)) {
            let stored = events
                .binary_search_by_key(&checkpoint.sequence, |e| e.sequence)
                .ok()
                .map(|i| &events[i]);
            if let Some(event) = stored {
                if event.self_hash != checkpoint.chain_hash {
                    report.issue(
                        checkpoint.sequence,
                        CheckpointMismatch,
                        "checkpoint hash differs from stored chain",
                    );
                }
            }
        }

        report.issues.sort_by_key(|i| i.sequence);
        report.valid = report.issues.is_empty();
        Ok(report)
    }

    /// Every stored, non-erased event about `identity`.
    pub async fn export_subject(&self, identity: &str) -> Result<SubjectExport, GatewayError> {
        self.flush().await?;
        let subject_key = self.subject_key(identity);
        let events = self.store.load_subject(&subject_key).await?;

        self.append(
            AuditRecord::new(AuditEventType::SubjectExported, AuditOutcome::Success)
                .meta("subject_key", &subject_key)
                .meta("events", events.len()),
        )
        .await?;
        info!(subject_key = %subject_key, events = events.len(), "subject data exported");

        Ok(SubjectExport {
            subject_key,
            exported_at: self.clock.now(),
            events,
        })
    }

    /// Tombstone every event about `identity`; returns how many.
    ///
    /// Records exactly one `SUBJECT_ERASED` event, which does not itself
    /// carry the subject but lists the sequences it erases. It is stored
    /// before anything is tombstoned, so every tombstone is accounted for.
    pub async fn erase_subject(&self, identity: &str) -> Result<usize, GatewayError> {
        let subject_key = self.subject_key(identity);
        let retries = self.config.flush_retries;
        let erased = {
            let _guard = self.flush_lock.lock().await;
            self.drain(retries).await?;
            let sequences: Vec<u64> = self
                .store
                .load_subject(&subject_key)
                .await?
                .iter()
                .map(|e| e.sequence)
                .collect();
            self.record(
                AuditRecord::new(AuditEventType::SubjectErased, AuditOutcome::Success)
                    .meta("subject_key", &subject_key)
                    .meta("erased", sequences.len())
                    .meta(ERASED_SEQUENCES, format_sequences(&sequences)),
            );
            self.drain(retries).await?;
            self.store.tombstone(&sequences).await?
        };

        self.counters.erased.fetch_add(1, Ordering::Relaxed);
        info!(subject_key = %subject_key, erased, "subject data erased");
        Ok(erased)
    }

    /// Drop events older than the retention period.
    ///
    /// A signed checkpoint at the purge point anchors the remaining chain,
    /// and a `RETENTION_PURGE` event records the purge.
    pub async fn purge_expired(&self) -> Result<usize, GatewayError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::days(i64::from(self.config.retention_days));
        let summary = {
            let _guard = self.flush_lock.lock().await;
            self.drain(self.config.flush_retries).await?;
            self.store.purge_before(cutoff).await?
        };
        let Some(summary) = summary else {
            return Ok(0);
        };

        let anchor = Checkpoint::sign(
            &self.checkpoint_key,
            summary.through_sequence,
            summary.chain_hash.clone(),
            now,
        );
        self.store.put_checkpoint(&anchor).await?;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.counters
            .purged
            .fetch_add(summary.purged as u64, Ordering::Relaxed);

        self.append(
            AuditRecord::new(AuditEventType::RetentionPurge, AuditOutcome::Success)
                .meta("purged", summary.purged)
                .meta("through_sequence", summary.through_sequence)
                .meta("cutoff", cutoff.to_rfc3339()),
        )
        .await?;
        info!(
            purged = summary.purged,
            through_sequence = summary.through_sequence,
            "expired audit events purged"
        );
        Ok(summary.purged)
    }

    /// Events recorded under `correlation_id`, oldest first.
    pub async fn events_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<AuditEvent>, GatewayError> {
        let sequences = match &self.correlation {
            Some(index) => index.lock().sequences(correlation_id),
            None => return Ok(Vec::new()),
        };
        self.flush().await?;
        self.store.load_sequences(&sequences).await
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.correlation
            .as_ref()
            .map(|index| index.lock().anomalies())
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> AuditMetrics {
        let (buffered, next_sequence) = {
            let chain = self.chain.lock();
            (chain.buffer.len(), chain.next_sequence)
        };
        AuditMetrics {
            events_appended: self.counters.appended.load(Ordering::Relaxed),
            events_flushed: self.counters.flushed.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
            checkpoints_written: self.counters.checkpoints.load(Ordering::Relaxed),
            anomalies_detected: self.counters.anomalies.load(Ordering::Relaxed),
            subjects_erased: self.counters.erased.load(Ordering::Relaxed),
            events_purged: self.counters.purged.load(Ordering::Relaxed),
            buffered,
            next_sequence,
            tracked_correlations: self
                .correlation
                .as_ref()
                .map(|index| index.lock().len())
                .unwrap_or(0),
        }
    }
}

/// Sequences listed by an intact `SUBJECT_ERASED` event.
fn erased_sequences(event: &AuditEvent) -> Option<Vec<RangeInclusive<u64>>> {
    if event.event_type != AuditEventType::SubjectErased || event.tombstone {
        return None;
    }
    event
        .metadata
        .get(ERASED_SEQUENCES)
        .map(|listed| parse_sequences(listed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SECRET: &str = "audit-test-secret";

    fn config() -> AuditConfig {
        AuditConfig {
            batch_size: 1000,
            flush_backoff_ms: 1,
            ..AuditConfig::default()
        }
    }

    async fn ledger_with(
        config: AuditConfig,
        store: Arc<dyn AuditStore>,
        clock: Arc<ManualClock>,
    ) -> AuditLedger {
        AuditLedger::open(config, &Capabilities::enterprise(), SECRET, store, clock)
            .await
            .unwrap()
    }

    fn admitted(identity: &str) -> AuditRecord {
        AuditRecord::new(AuditEventType::RequestAdmitted, AuditOutcome::Success)
            .identity(identity)
            .target("anthropic")
    }

    #[tokio::test]
    async fn test_chain_links_and_verifies() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;

        for _ in 0..5 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        assert_eq!(store.len(), 0, "below batch size nothing is written");
        assert_eq!(ledger.flush().await.unwrap(), 5);

        let events = store.load_range(0..5).await.unwrap();
        assert_eq!(events[0].previous_hash, GENESIS_HASH_V1);
        for pair in events.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].self_hash);
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
        }

        let report = ledger.verify_all().await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
        assert_eq!(report.checked, 5);
    }

    #[tokio::test]
    async fn test_tampered_event_is_reported() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..6 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        ledger.flush().await.unwrap();

        store.tamper(3, |e| e.target = Some("openai".to_string()));

        let report = ledger.verify_all().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.issues[0].sequence, 3);
        assert_eq!(report.issues[0].kind, IntegrityIssueKind::HashMismatch);

        // The violation itself is recorded.
        let tail = store.tail().await.unwrap().unwrap();
        assert_eq!(tail.event_type, AuditEventType::IntegrityViolation);
    }

    #[tokio::test]
    async fn test_relinked_event_breaks_next_link() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..4 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        ledger.flush().await.unwrap();

        store.tamper(1, |e| {
            e.target = Some("openai".to_string());
            e.self_hash = e.compute_hash();
        });

        let report = ledger.verify_integrity(0..4).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.issues[0].sequence, 2);
        assert_eq!(report.issues[0].kind, IntegrityIssueKind::BrokenLink);
    }

    #[tokio::test]
    async fn test_error_severity_forces_flush() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;

        ledger.append(admitted("alice")).await.unwrap();
        assert!(store.is_empty());

        ledger
            .append(
                AuditRecord::new(AuditEventType::RequestFailed, AuditOutcome::Error)
                    .identity("alice"),
            )
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_full_batch_is_written() {
        let store = Arc::new(MemoryAuditStore::new());
        let cfg = AuditConfig {
            batch_size: 3,
            ..config()
        };
        let ledger = ledger_with(cfg, store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..3 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(ledger.metrics().buffered, 0);
    }

    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryAuditStore,
        failures: AtomicUsize,
        stall: Duration,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append_batch(&self, events: &[AuditEvent]) -> Result<(), GatewayError> {
            if !self.stall.is_zero() {
                tokio::time::sleep(self.stall).await;
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(GatewayError::Storage("disk unavailable".to_string()));
            }
            self.inner.append_batch(events).await
        }
        async fn load_range(&self, range: Range<u64>) -> Result<Vec<AuditEvent>, GatewayError> {
            self.inner.load_range(range).await
        }
        async fn load_subject(&self, key: &str) -> Result<Vec<AuditEvent>, GatewayError> {
            self.inner.load_subject(key).await
        }
        async fn tombstone(&self, sequences: &[u64]) -> Result<usize, GatewayError> {
            self.inner.tombstone(sequences).await
        }
        async fn purge_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Option<PurgeSummary>, GatewayError> {
            self.inner.purge_before(cutoff).await
        }
        async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), GatewayError> {
            self.inner.put_checkpoint(checkpoint).await
        }
        async fn checkpoints(&self) -> Result<Vec<Checkpoint>, GatewayError> {
            self.inner.checkpoints().await
        }
        async fn bounds(&self) -> Result<Option<(u64, u64)>, GatewayError> {
            self.inner.bounds().await
        }
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let store = Arc::new(FlakyStore::default());
        let cfg = AuditConfig {
            flush_retries: 1,
            ..config()
        };
        let ledger = ledger_with(cfg, store.clone(), Arc::new(ManualClock::new())).await;

        ledger.append(admitted("alice")).await.unwrap();
        store.failures.store(5, Ordering::SeqCst);
        let forced = ledger
            .append(AuditRecord::new(AuditEventType::RequestFailed, AuditOutcome::Error))
            .await;
        assert!(forced.is_err());
        assert_eq!(ledger.metrics().buffered, 2);
        assert_eq!(ledger.metrics().flush_failures, 1);

        ledger.append(admitted("bob")).await.unwrap();
        store.failures.store(1, Ordering::SeqCst);
        assert_eq!(ledger.flush().await.unwrap(), 3);

        let report = ledger.verify_all().await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
        assert_eq!(report.checked, 3);
    }

    #[tokio::test]
    async fn test_checkpoints_anchor_partial_verification() {
        let store = Arc::new(MemoryAuditStore::new());
        let cfg = AuditConfig {
            checkpoint_interval: 4,
            ..config()
        };
        let ledger = ledger_with(cfg, store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..10 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        ledger.flush().await.unwrap();

        let checkpoints = store.checkpoints().await.unwrap();
        assert_eq!(
            checkpoints.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![3, 7]
        );

        let report = ledger.verify_integrity(5..10).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.anchor, Some(3));
        assert_eq!(report.checked, 6);
    }

    #[tokio::test]
    async fn test_forged_checkpoint_is_reported() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..3 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        ledger.flush().await.unwrap();
        store
            .put_checkpoint(&Checkpoint {
                sequence: 1,
                chain_hash: "ab".repeat(32),
                created_at: Utc::now(),
                signature: "00".repeat(32),
            })
            .await
            .unwrap();

        let report = ledger.verify_integrity(2..3).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.anchor, None);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IntegrityIssueKind::CheckpointSignature));
    }

    #[tokio::test]
    async fn test_export_and_erase_subject() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..3 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        ledger.append(admitted("bob")).await.unwrap();

        let export = ledger.export_subject("alice").await.unwrap();
        assert_eq!(export.events.len(), 3);
        assert_eq!(export.subject_key, ledger.subject_key("alice"));

        let before = ledger.metrics().next_sequence;
        assert_eq!(ledger.erase_subject("alice").await.unwrap(), 3);
        assert_eq!(ledger.metrics().next_sequence, before + 1);

        let tail = store.tail().await.unwrap().unwrap();
        assert_eq!(tail.event_type, AuditEventType::SubjectErased);
        assert!(tail.subject_key.is_none());
        assert_eq!(tail.metadata.get("sequences").map(String::as_str), Some("0-2"));

        assert!(ledger.export_subject("alice").await.unwrap().events.is_empty());
        assert_eq!(ledger.export_subject("bob").await.unwrap().events.len(), 1);

        let report = ledger.verify_all().await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
        assert_eq!(report.tombstones, 3);
    }

    #[tokio::test]
    async fn test_retention_purge_keeps_chain_verifiable() {
        let store = Arc::new(MemoryAuditStore::new());
        let clock = Arc::new(ManualClock::new());
        let cfg = AuditConfig {
            retention_days: 30,
            ..config()
        };
        let ledger = ledger_with(cfg, store.clone(), clock.clone()).await;
        for _ in 0..3 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        clock.advance(Duration::from_secs(40 * 86_400));
        for _ in 0..2 {
            ledger.append(admitted("alice")).await.unwrap();
        }

        assert_eq!(ledger.purge_expired().await.unwrap(), 3);
        assert_eq!(ledger.purge_expired().await.unwrap(), 0);

        let report = ledger.verify_all().await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
        assert_eq!(report.anchor, Some(2));
        assert_eq!(ledger.metrics().events_purged, 3);
    }

    #[tokio::test]
    async fn test_reopen_continues_chain() {
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let clock = Arc::new(ManualClock::new());
        {
            let ledger = ledger_with(config(), store.clone(), clock.clone()).await;
            ledger.append(admitted("alice")).await.unwrap();
            ledger.shutdown().await.unwrap();
        }
        let ledger = ledger_with(config(), store.clone(), clock).await;
        ledger.append(admitted("alice")).await.unwrap();
        assert_eq!(ledger.metrics().next_sequence, 2);
        assert!(ledger.verify_all().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_pii_is_masked_before_hashing() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        ledger
            .append(
                AuditRecord::new(AuditEventType::PermissionDenied, AuditOutcome::Denied)
                    .identity("alice@example.com")
                    .ip_address(Some("203.0.113.9"))
                    .meta("note", "contact alice@example.com"),
            )
            .await
            .unwrap();
        ledger.flush().await.unwrap();

        let event = store.tail().await.unwrap().unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("alice@example.com"));
        assert!(!json.contains("203.0.113.9"));
        assert_eq!(event.actor.as_deref(), Some(ledger.subject_key("alice@example.com").as_str()));
        assert_eq!(event.compute_hash(), event.self_hash);
    }

    #[tokio::test]
    async fn test_repeated_failures_raise_anomaly() {
        let store = Arc::new(MemoryAuditStore::new());
        let cfg = AuditConfig {
            correlation_failure_threshold: 3,
            ..config()
        };
        let ledger = ledger_with(cfg, store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..3 {
            ledger
                .append(
                    AuditRecord::new(AuditEventType::ValidationFailed, AuditOutcome::Denied)
                        .identity("mallory")
                        .correlation_id(Some("trace-7")),
                )
                .await
                .unwrap();
        }

        let anomalies = ledger.anomalies();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].correlation_id, "trace-7");

        let events = ledger.events_for_correlation("trace-7").await.unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].event_type, AuditEventType::AnomalyDetected);
        assert_eq!(events[3].severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_write_stays_queued() {
        let store = Arc::new(FlakyStore {
            stall: Duration::from_millis(50),
            ..FlakyStore::default()
        });
        let cfg = AuditConfig {
            batch_size: 1,
            ..config()
        };
        let ledger = ledger_with(cfg, store.clone(), Arc::new(ManualClock::new())).await;

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), ledger.append(admitted("alice"))).await;
        assert!(cancelled.is_err());
        assert_eq!(ledger.metrics().buffered, 1);

        ledger.append(admitted("bob")).await.unwrap();
        assert_eq!(ledger.metrics().buffered, 0);
        assert_eq!(store.inner.len(), 2);

        let report = ledger.verify_all().await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
        assert_eq!(report.checked, 2);
    }

    #[tokio::test]
    async fn test_flagged_tombstone_is_reported() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..4 {
            ledger
                .append(
                    AuditRecord::new(AuditEventType::PermissionDenied, AuditOutcome::Denied)
                        .identity("mallory")
                        .target("anthropic"),
                )
                .await
                .unwrap();
        }
        ledger.flush().await.unwrap();

        store.tamper(1, |e| {
            e.event_type = AuditEventType::RequestAdmitted;
            e.outcome = AuditOutcome::Success;
            e.target = Some("openai".to_string());
            e.tombstone = true;
        });

        let report = ledger.verify_all().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.tombstones, 1);
        assert!(report
            .issues
            .iter()
            .any(|i| i.sequence == 1 && i.kind == IntegrityIssueKind::MalformedTombstone));
    }

    #[tokio::test]
    async fn test_tombstone_without_erasure_record_is_reported() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        for _ in 0..3 {
            ledger.append(admitted("alice")).await.unwrap();
        }
        ledger.flush().await.unwrap();

        // A correctly sealed tombstone that no erasure accounts for.
        store.tamper(1, |e| *e = e.clone().into_tombstone());

        let report = ledger.verify_integrity(0..3).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].sequence, 1);
        assert_eq!(report.issues[0].kind, IntegrityIssueKind::UnrecordedErasure);
    }

    #[tokio::test]
    async fn test_erasure_record_outside_range_covers_tombstones() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        ledger.append(admitted("alice")).await.unwrap();
        ledger.append(admitted("bob")).await.unwrap();
        ledger.erase_subject("alice").await.unwrap();

        let report = ledger.verify_integrity(0..1).await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
        assert_eq!(report.tombstones, 1);
    }

    #[tokio::test]
    async fn test_pseudonym_shaped_identity_gets_its_own_key() {
        let store = Arc::new(MemoryAuditStore::new());
        let ledger = ledger_with(config(), store.clone(), Arc::new(ManualClock::new())).await;
        let alice_key = ledger.subject_key("alice");
        ledger.append(admitted("alice")).await.unwrap();
        ledger.append(admitted(&alice_key)).await.unwrap();

        assert_ne!(ledger.subject_key(&alice_key), alice_key);
        assert_eq!(ledger.export_subject("alice").await.unwrap().events.len(), 1);

        assert_eq!(ledger.erase_subject(&alice_key).await.unwrap(), 1);
        let export = ledger.export_subject("alice").await.unwrap();
        assert_eq!(export.events.len(), 1);
        assert_eq!(export.events[0].sequence, 0);
    }

    #[tokio::test]
    async fn test_open_refuses_tampered_tail() {
        let store = Arc::new(MemoryAuditStore::new());
        let clock = Arc::new(ManualClock::new());
        {
            let ledger = ledger_with(config(), store.clone(), clock.clone()).await;
            ledger.append(admitted("alice")).await.unwrap();
            ledger.append(admitted("alice")).await.unwrap();
            ledger.shutdown().await.unwrap();
        }
        store.tamper(1, |e| e.target = Some("openai".to_string()));

        let err = AuditLedger::open(
            config(),
            &Capabilities::enterprise(),
            SECRET,
            store,
            clock,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::IntegrityViolation(_)));
    }
}
