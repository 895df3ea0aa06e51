//! Audit event types and chain hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Hash preceding the first event of a version-1 chain.
pub const GENESIS_HASH_V1: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Domain tag mixed into every version-1 chain hash.
const CHAIN_VERSION_TAG: &[u8] = b"llm-gateway-audit-chain/v1";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    PermissionDenied,
    AuthenticationRequired,
    RiskThresholdExceeded,
    RateLimited,
    ConcurrencyLimited,
    IdentityBlocked,
    CircuitOpen,
    ValidationFailed,
    InputSanitized,
    RequestAdmitted,
    ResponseBlocked,
    RequestCompleted,
    RequestFailed,
    RequestTimedOut,
    SessionCreated,
    SessionRevoked,
    SubjectExported,
    SubjectErased,
    RetentionPurge,
    AnomalyDetected,
    IntegrityViolation,
}

impl AuditEventType {
    pub fn default_severity(self) -> Severity {
        use AuditEventType::*;
        match self {
            RequestAdmitted | RequestCompleted | SessionCreated | SessionRevoked
            | SubjectExported | RetentionPurge | InputSanitized | AuthenticationRequired => {
                Severity::Info
            }
            RateLimited | ConcurrencyLimited => Severity::Notice,
            PermissionDenied | IdentityBlocked | CircuitOpen | ValidationFailed
            | ResponseBlocked | RequestTimedOut | AnomalyDetected | SubjectErased => {
                Severity::Warning
            }
            RequestFailed | RiskThresholdExceeded => Severity::Error,
            IntegrityViolation => Severity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        use AuditEventType::*;
        match self {
            PermissionDenied => "PERMISSION_DENIED",
            AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            RiskThresholdExceeded => "RISK_THRESHOLD_EXCEEDED",
            RateLimited => "RATE_LIMITED",
            ConcurrencyLimited => "CONCURRENCY_LIMITED",
            IdentityBlocked => "IDENTITY_BLOCKED",
            CircuitOpen => "CIRCUIT_OPEN",
            ValidationFailed => "VALIDATION_FAILED",
            InputSanitized => "INPUT_SANITIZED",
            RequestAdmitted => "REQUEST_ADMITTED",
            ResponseBlocked => "RESPONSE_BLOCKED",
            RequestCompleted => "REQUEST_COMPLETED",
            RequestFailed => "REQUEST_FAILED",
            RequestTimedOut => "REQUEST_TIMED_OUT",
            SessionCreated => "SESSION_CREATED",
            SessionRevoked => "SESSION_REVOKED",
            SubjectExported => "SUBJECT_EXPORTED",
            SubjectErased => "SUBJECT_ERASED",
            RetentionPurge => "RETENTION_PURGE",
            AnomalyDetected => "ANOMALY_DETECTED",
            IntegrityViolation => "INTEGRITY_VIOLATION",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity. `Error` and above force an immediate flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn forces_flush(self) -> bool {
        self >= Severity::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    Error,
}

impl AuditOutcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, AuditOutcome::Success)
    }
}

/// Caller-supplied description of an event, before masking and hashing.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub outcome: AuditOutcome,
    pub actor: Option<String>,
    /// Raw identity the event is about; stored only as a pseudonymous key.
    pub subject: Option<String>,
    pub target: Option<String>,
    pub correlation_id: Option<String>,
    pub ip_address: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, outcome: AuditOutcome) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            outcome,
            actor: None,
            subject: None,
            target: None,
            correlation_id: None,
            ip_address: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets both actor and subject to `identity`.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        self.actor = Some(identity.clone());
        self.subject = Some(identity);
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn correlation_id(mut self, id: Option<&str>) -> Self {
        self.correlation_id = id.map(str::to_string);
        self
    }

    pub fn ip_address(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_string);
        self
    }

    pub fn meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// A hashed, sequenced ledger entry.
///
/// Never mutated after hashing, except that erasure may replace it with a
/// tombstone. A tombstone keeps its header fields and hashes, drops every
/// content field and seals the digest of the content it dropped, so its
/// chain hash still verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub outcome: AuditOutcome,
    pub actor: Option<String>,
    pub subject_key: Option<String>,
    pub target: Option<String>,
    pub correlation_id: Option<String>,
    pub ip_address: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub previous_hash: String,
    pub self_hash: String,
    #[serde(default)]
    pub tombstone: bool,
    /// Hex digest of the erased content; set on tombstones only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_content: Option<String>,
}

/// Hashed header of an event. Field order is part of the chain format.
#[derive(Serialize)]
struct HashedHeader<'a> {
    event_id: &'a str,
    timestamp: &'a DateTime<Utc>,
    event_type: AuditEventType,
    severity: Severity,
    outcome: AuditOutcome,
    content: &'a str,
}

/// Erasable part of an event, hashed separately so erasure can seal it.
#[derive(Serialize)]
struct HashedContent<'a> {
    actor: &'a Option<String>,
    subject_key: &'a Option<String>,
    target: &'a Option<String>,
    correlation_id: &'a Option<String>,
    ip_address: &'a Option<String>,
    metadata: &'a BTreeMap<String, String>,
}

impl AuditEvent {
    /// Hex SHA-256 of the canonical JSON of the content fields.
    fn content_digest(&self) -> String {
        let content = HashedContent {
            actor: &self.actor,
            subject_key: &self.subject_key,
            target: &self.target,
            correlation_id: &self.correlation_id,
            ip_address: &self.ip_address,
            metadata: &self.metadata,
        };
        // Serializing borrowed strings and a BTreeMap cannot fail.
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// SHA-256 of the canonical JSON of the header and content digest.
    ///
    /// Tombstones contribute their sealed digest instead of recomputing it.
    pub(crate) fn body_digest(&self) -> [u8; 32] {
        let content = match (&self.sealed_content, self.tombstone) {
            (Some(sealed), true) => sealed.clone(),
            _ => self.content_digest(),
        };
        let header = HashedHeader {
            event_id: &self.event_id,
            timestamp: &self.timestamp,
            event_type: self.event_type,
            severity: self.severity,
            outcome: self.outcome,
            content: &content,
        };
        let bytes = serde_json::to_vec(&header).unwrap_or_default();
        Sha256::digest(&bytes).into()
    }

    /// Recompute this event's chain hash from its content.
    pub fn compute_hash(&self) -> String {
        chain_hash(&self.body_digest(), self.sequence, &self.previous_hash)
    }

    /// Drop the content, sealing its digest in place.
    pub(crate) fn into_tombstone(self) -> Self {
        if self.tombstone {
            return self;
        }
        let sealed = self.content_digest();
        Self {
            actor: None,
            subject_key: None,
            target: None,
            correlation_id: None,
            ip_address: None,
            metadata: BTreeMap::new(),
            tombstone: true,
            sealed_content: Some(sealed),
            ..self
        }
    }

    /// A tombstone must carry its sealed digest and nothing it erased.
    pub(crate) fn is_sealed_tombstone(&self) -> bool {
        self.tombstone
            && self.sealed_content.is_some()
            && self.actor.is_none()
            && self.subject_key.is_none()
            && self.target.is_none()
            && self.correlation_id.is_none()
            && self.ip_address.is_none()
            && self.metadata.is_empty()
    }

    pub(crate) fn concerns(&self, subject_key: &str) -> bool {
        self.subject_key.as_deref() == Some(subject_key) || self.actor.as_deref() == Some(subject_key)
    }
}

/// Compact `a-b,c` form of ascending sequence numbers, as recorded by
/// `SUBJECT_ERASED` events.
pub(crate) fn format_sequences(sequences: &[u64]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = sequences.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{}-{}", start, end)
        });
    }
    parts.join(",")
}

/// Inverse of [`format_sequences`]; malformed parts are skipped.
pub(crate) fn parse_sequences(text: &str) -> Vec<std::ops::RangeInclusive<u64>> {
    text.split(',')
        .filter_map(|part| match part.split_once('-') {
            Some((a, b)) => Some(a.trim().parse().ok()?..=b.trim().parse().ok()?),
            None => {
                let n = part.trim().parse().ok()?;
                Some(n..=n)
            }
        })
        .collect()
}

/// `hex(SHA-256(version_tag || body_digest || sequence_be || previous_hash))`
pub(crate) fn chain_hash(body_digest: &[u8; 32], sequence: u64, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CHAIN_VERSION_TAG);
    hasher.update(body_digest);
    hasher.update(sequence.to_be_bytes());
    hasher.update(previous_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sequence: u64, previous_hash: &str) -> AuditEvent {
        let mut event = AuditEvent {
            sequence,
            event_id: format!("evt-{}", sequence),
            timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            event_type: AuditEventType::RequestAdmitted,
            severity: Severity::Info,
            outcome: AuditOutcome::Success,
            actor: Some("id:0123456789abcdef".to_string()),
            subject_key: Some("id:0123456789abcdef".to_string()),
            target: Some("anthropic".to_string()),
            correlation_id: None,
            ip_address: None,
            metadata: BTreeMap::new(),
            previous_hash: previous_hash.to_string(),
            self_hash: String::new(),
            tombstone: false,
            sealed_content: None,
        };
        event.self_hash = event.compute_hash();
        event
    }

    #[test]
    fn test_hash_covers_content_sequence_and_link() {
        let base = sample(0, GENESIS_HASH_V1);

        let mut changed = base.clone();
        changed.target = Some("openai".to_string());
        assert_ne!(changed.compute_hash(), base.self_hash);

        let mut moved = base.clone();
        moved.sequence = 1;
        assert_ne!(moved.compute_hash(), base.self_hash);

        let relinked = sample(0, &"f".repeat(64));
        assert_ne!(relinked.self_hash, base.self_hash);
    }

    #[test]
    fn test_hash_survives_json_round_trip() {
        let event = sample(3, GENESIS_HASH_V1);
        let json = serde_json::to_string(&event).unwrap();
        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.compute_hash(), event.self_hash);
    }

    #[test]
    fn test_tombstone_seals_content_and_still_verifies() {
        let event = sample(0, GENESIS_HASH_V1);
        let hash = event.self_hash.clone();
        let tomb = event.into_tombstone();
        assert!(tomb.is_sealed_tombstone());
        assert!(tomb.actor.is_none() && tomb.subject_key.is_none());
        assert_eq!(tomb.self_hash, hash);
        assert_eq!(tomb.compute_hash(), hash);
        assert_eq!(tomb.previous_hash, GENESIS_HASH_V1);
    }

    #[test]
    fn test_tombstone_header_is_still_covered() {
        let tomb = sample(0, GENESIS_HASH_V1).into_tombstone();

        let mut retyped = tomb.clone();
        retyped.event_type = AuditEventType::RequestCompleted;
        assert_ne!(retyped.compute_hash(), tomb.self_hash);

        let mut reworded = tomb.clone();
        reworded.outcome = AuditOutcome::Denied;
        assert_ne!(reworded.compute_hash(), tomb.self_hash);

        let mut refilled = tomb.clone();
        refilled.target = Some("openai".to_string());
        assert!(!refilled.is_sealed_tombstone());
    }

    #[test]
    fn test_flagging_without_sealing_breaks_hash() {
        let mut flagged = sample(0, GENESIS_HASH_V1);
        flagged.event_type = AuditEventType::RequestCompleted;
        flagged.tombstone = true;
        assert!(!flagged.is_sealed_tombstone());
        assert_ne!(flagged.compute_hash(), flagged.self_hash);
    }

    #[test]
    fn test_sequence_ranges() {
        assert_eq!(format_sequences(&[0, 1, 2, 5, 7, 8]), "0-2,5,7-8");
        assert_eq!(format_sequences(&[]), "");
        let ranges = parse_sequences("0-2,5,x,7-8");
        assert_eq!(ranges, vec![0..=2, 5..=5, 7..=8]);
    }

    #[test]
    fn test_default_severities() {
        assert!(AuditEventType::RequestFailed.default_severity().forces_flush());
        assert!(!AuditEventType::PermissionDenied.default_severity().forces_flush());
        assert_eq!(
            serde_json::to_string(&AuditEventType::PermissionDenied).unwrap(),
            "\"PERMISSION_DENIED\""
        );
    }
}
