//! HMAC-SHA256 helpers and purpose-specific key derivation.
//!
//! A single configured signing secret is expanded into independent keys for
//! session tokens, audit checkpoints and PII pseudonyms, so a leak of one
//! derived value does not expose the others.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub(crate) const SESSION_TOKEN_LABEL: &str = "llm-gateway/session-token/v1";
pub(crate) const CHECKPOINT_LABEL: &str = "llm-gateway/audit-checkpoint/v1";
pub(crate) const PII_SALT_LABEL: &str = "llm-gateway/pii-salt/v1";

/// 32-byte key bound to one purpose.
#[derive(Clone)]
pub(crate) struct SigningKey([u8; 32]);

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

impl SigningKey {
    /// `HMAC(secret, label)`.
    pub fn derive(secret: &str, label: &str) -> Self {
        let mut mac = new_mac(secret.as_bytes());
        mac.update(label.as_bytes());
        Self(mac.finalize().into_bytes().into())
    }

    /// Hex-encoded HMAC of the concatenated `parts`, each followed by `|`.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        hex::encode(self.mac(parts).finalize().into_bytes())
    }

    /// Constant-time check of a hex signature.
    pub fn verify(&self, parts: &[&[u8]], signature_hex: &str) -> bool {
        match hex::decode(signature_hex) {
            Ok(bytes) => self.mac(parts).verify_slice(&bytes).is_ok(),
            Err(_) => false,
        }
    }

    fn mac(&self, parts: &[&[u8]]) -> HmacSha256 {
        let mut mac = new_mac(&self.0);
        for part in parts {
            mac.update(part);
            mac.update(b"|");
        }
        mac
    }
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_give_independent_keys() {
        let a = SigningKey::derive("secret", SESSION_TOKEN_LABEL);
        let b = SigningKey::derive("secret", CHECKPOINT_LABEL);
        assert_ne!(a.sign(&[b"x"]), b.sign(&[b"x"]));
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::derive("secret", PII_SALT_LABEL);
        let sig = key.sign(&[b"alice", b"42"]);
        assert!(key.verify(&[b"alice", b"42"], &sig));
        // Part boundaries are part of the message.
        assert!(!key.verify(&[b"alice4", b"2"], &sig));
        assert!(!key.verify(&[b"alice", b"42"], "not-hex"));
        let other = SigningKey::derive("other", PII_SALT_LABEL);
        assert!(!other.verify(&[b"alice", b"42"], &sig));
    }
}
