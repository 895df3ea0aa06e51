//! Gateway error types.
//!
//! Security outcomes (deny, rate limit, challenge) are returned as values, see
//! [`crate::gateway::GatewayDecision`]. The variants here are for conditions
//! that are exceptional for the process: bad configuration, broken storage,
//! tampered tokens or ledgers.

/// Errors that can occur in the security gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration values failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration source could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Session token is malformed or its signature does not verify.
    #[error("Invalid session token: {0}")]
    InvalidSessionToken(String),

    /// Session token is older than its TTL.
    #[error("Session token expired: {0}")]
    ExpiredSessionToken(String),

    /// Session was never issued or has been revoked.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Session exceeded its idle timeout.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Audit persistence backend failed.
    #[error("Audit storage error: {0}")]
    Storage(String),

    /// Event or checkpoint (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored audit chain cannot be extended consistently.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Tracing subscriber could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}
