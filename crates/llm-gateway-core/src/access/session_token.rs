//! Signed session tokens.
//!
//! A token binds an identity to a session id at an issue time. The gateway
//! only resumes sessions it still holds; the signature stops callers from
//! forging a token for someone else's session id.

use crate::error::GatewayError;
use crate::keys::SigningKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tolerated clock skew for tokens issued "in the future".
const MAX_CLOCK_SKEW_SECONDS: i64 = 30;

/// HMAC-signed session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub identity: String,
    pub session_id: String,
    /// Issue time, RFC 3339.
    pub issued_at: String,
    /// Hex HMAC-SHA256 over `identity|session_id|issued_at|`.
    pub signature: String,
}

impl SessionToken {
    pub(crate) fn issue(
        identity: &str,
        session_id: &str,
        issued_at: DateTime<Utc>,
        key: &SigningKey,
    ) -> Result<Self, GatewayError> {
        if identity.is_empty() || session_id.is_empty() {
            return Err(GatewayError::InvalidSessionToken(
                "identity and session_id must not be empty".to_string(),
            ));
        }
        let issued_at = issued_at.to_rfc3339();
        let signature = key.sign(&[
            identity.as_bytes(),
            session_id.as_bytes(),
            issued_at.as_bytes(),
        ]);
        Ok(Self {
            identity: identity.to_string(),
            session_id: session_id.to_string(),
            issued_at,
            signature,
        })
    }

    /// Check signature, TTL and skew against `now`.
    pub(crate) fn verify(
        &self,
        key: &SigningKey,
        now: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Result<(), GatewayError> {
        if self.identity.is_empty() || self.session_id.is_empty() || self.signature.is_empty() {
            return Err(GatewayError::InvalidSessionToken(
                "missing required field".to_string(),
            ));
        }

        let signed = key.verify(
            &[
                self.identity.as_bytes(),
                self.session_id.as_bytes(),
                self.issued_at.as_bytes(),
            ],
            &self.signature,
        );
        if !signed {
            return Err(GatewayError::InvalidSessionToken(
                "signature mismatch".to_string(),
            ));
        }

        let issued_at: DateTime<Utc> = self.issued_at.parse().map_err(|_| {
            GatewayError::InvalidSessionToken("invalid issued_at timestamp".to_string())
        })?;
        let age = now.signed_duration_since(issued_at).num_seconds();

        if age > ttl_seconds {
            return Err(GatewayError::ExpiredSessionToken(format!(
                "age: {}s, TTL: {}s",
                age, ttl_seconds
            )));
        }
        if age < -MAX_CLOCK_SKEW_SECONDS {
            return Err(GatewayError::InvalidSessionToken(
                "issued_at is in the future".to_string(),
            ));
        }
        Ok(())
    }
}
