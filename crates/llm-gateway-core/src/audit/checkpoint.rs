//! Signed chain checkpoints.

use crate::keys::SigningKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signed statement that the chain hash after `sequence` was `chain_hash`.
///
/// Verification may start from a valid checkpoint instead of genesis, and
/// retention purges leave one behind as the anchor for the remaining chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    pub chain_hash: String,
    pub created_at: DateTime<Utc>,
    pub signature: String,
}

impl Checkpoint {
    pub(crate) fn sign(
        key: &SigningKey,
        sequence: u64,
        chain_hash: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let signature = key.sign(&[&sequence.to_be_bytes(), chain_hash.as_bytes()]);
        Self {
            sequence,
            chain_hash,
            created_at,
            signature,
        }
    }

    pub(crate) fn is_authentic(&self, key: &SigningKey) -> bool {
        key.verify(
            &[&self.sequence.to_be_bytes(), self.chain_hash.as_bytes()],
            &self.signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::CHECKPOINT_LABEL;

    #[test]
    fn test_checkpoint_signature() {
        let key = SigningKey::derive("secret", CHECKPOINT_LABEL);
        let cp = Checkpoint::sign(&key, 999, "ab".repeat(32), Utc::now());
        assert!(cp.is_authentic(&key));

        let mut moved = cp.clone();
        moved.sequence = 1000;
        assert!(!moved.is_authentic(&key));

        let mut rehashed = cp.clone();
        rehashed.chain_hash = "cd".repeat(32);
        assert!(!rehashed.is_authentic(&key));

        assert!(!cp.is_authentic(&SigningKey::derive("other", CHECKPOINT_LABEL)));
    }
}
