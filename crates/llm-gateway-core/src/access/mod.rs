//! Access management: security contexts, sessions and per-identity risk.

mod roles;
mod session_token;

pub use roles::{permissions_for, Permission, PermissionSet, Role};
pub use session_token::SessionToken;

use crate::clock::SharedClock;
use crate::config::AccessConfig;
use crate::error::GatewayError;
use crate::keys::{SigningKey, SESSION_TOKEN_LABEL};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a request came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMetadata {
    pub ip_address: Option<String>,
    pub location: Option<String>,
}

/// Who is calling and what they may do.
///
/// Permissions are derived from roles once, at creation. `risk_score` is a
/// snapshot taken when the context was looked up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub identity: String,
    pub session_id: String,
    pub roles: Vec<Role>,
    pub permissions: PermissionSet,
    pub network: Option<NetworkMetadata>,
    pub risk_score: f64,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
}

impl SecurityContext {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.network.as_ref()?.ip_address.as_deref()
    }
}

/// Result of folding a new observation into an identity's risk score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskUpdate {
    pub score: f64,
    pub blocked: bool,
    /// This update pushed the identity over the block threshold.
    pub newly_blocked: bool,
}

/// Access manager counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessMetrics {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub sessions_revoked: u64,
    pub tracked_identities: usize,
    pub blocked_identities: usize,
}

struct SessionEntry {
    context: SecurityContext,
    last_used: Duration,
}

/// Scores below this carry no history worth keeping once idle.
const RISK_FORGET_BELOW: f64 = 0.01;

#[derive(Default)]
struct RiskEntry {
    score: f64,
    blocked: bool,
    last_update: Duration,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    expired: AtomicU64,
    revoked: AtomicU64,
}

/// Issues and resolves security contexts and tracks risk per identity.
pub struct AccessManager {
    config: AccessConfig,
    clock: SharedClock,
    token_key: SigningKey,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    risk: RwLock<HashMap<String, Arc<Mutex<RiskEntry>>>>,
    counters: Counters,
}

impl AccessManager {
    pub fn new(config: AccessConfig, signing_secret: &str, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            token_key: SigningKey::derive(signing_secret, SESSION_TOKEN_LABEL),
            sessions: RwLock::new(HashMap::new()),
            risk: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Start an authenticated session for `identity`.
    pub fn create_context(
        &self,
        identity: &str,
        roles: &[Role],
        network: Option<NetworkMetadata>,
    ) -> SecurityContext {
        let context = SecurityContext {
            identity: identity.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            roles: roles.to_vec(),
            permissions: permissions_for(roles),
            network,
            risk_score: self.risk_score(identity),
            authenticated: true,
            created_at: self.clock.now(),
        };

        self.sessions.write().insert(
            context.session_id.clone(),
            Arc::new(Mutex::new(SessionEntry {
                context: context.clone(),
                last_used: self.clock.elapsed(),
            })),
        );
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %context.session_id, roles = ?context.roles, "session created");
        context
    }

    /// Unauthenticated, unstored context for a bare identity.
    pub fn anonymous_context(&self, identity: &str, roles: &[Role]) -> SecurityContext {
        SecurityContext {
            identity: identity.to_string(),
            session_id: String::new(),
            roles: roles.to_vec(),
            permissions: permissions_for(roles),
            network: None,
            risk_score: self.risk_score(identity),
            authenticated: false,
            created_at: self.clock.now(),
        }
    }

    /// Sign a token for an existing session.
    pub fn issue_token(&self, context: &SecurityContext) -> Result<SessionToken, GatewayError> {
        if !self.sessions.read().contains_key(&context.session_id) {
            return Err(GatewayError::UnknownSession(context.session_id.clone()));
        }
        SessionToken::issue(
            &context.identity,
            &context.session_id,
            self.clock.now(),
            &self.token_key,
        )
    }

    /// Look up a live session, enforcing the idle timeout lazily.
    pub fn context(&self, session_id: &str) -> Result<SecurityContext, GatewayError> {
        let now = self.clock.elapsed();
        let entry = self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;

        let mut session = entry.lock();
        if now.saturating_sub(session.last_used) > self.config.session_idle() {
            drop(session);
            if self.sessions.write().remove(session_id).is_some() {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
            }
            debug!(session_id = %session_id, "session expired on access");
            return Err(GatewayError::SessionExpired(session_id.to_string()));
        }
        session.last_used = now;

        let mut context = session.context.clone();
        context.risk_score = self.risk_score(&context.identity);
        Ok(context)
    }

    /// Resolve a signed token to its session.
    pub fn resume(&self, token: &SessionToken) -> Result<SecurityContext, GatewayError> {
        token.verify(&self.token_key, self.clock.now(), self.config.token_ttl_secs)?;
        let context = self.context(&token.session_id)?;
        if context.identity != token.identity {
            return Err(GatewayError::InvalidSessionToken(
                "token does not belong to session".to_string(),
            ));
        }
        Ok(context)
    }

    /// End a session. Returns whether it existed.
    pub fn revoke(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            self.counters.revoked.fetch_add(1, Ordering::Relaxed);
            info!(session_id = %session_id, "session revoked");
        }
        removed
    }

    /// Fold `observed` (0..=1) into the identity's EMA risk score.
    pub fn update_risk(&self, identity: &str, observed: f64) -> RiskUpdate {
        let observed = if observed.is_finite() {
            observed.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let entry = self.risk_entry(identity);
        let mut risk = entry.lock();

        let alpha = self.config.ema_alpha;
        risk.score = alpha * observed + (1.0 - alpha) * risk.score;
        risk.last_update = self.clock.elapsed();

        let newly_blocked = !risk.blocked && risk.score >= self.config.block_threshold;
        if newly_blocked {
            risk.blocked = true;
            metrics::counter!("gateway_identities_risk_blocked_total").increment(1);
            warn!(
                identity = %crate::audit::mask_identity(identity),
                score = risk.score,
                "identity blocked on risk score"
            );
        }
        RiskUpdate {
            score: risk.score,
            blocked: risk.blocked,
            newly_blocked,
        }
    }

    pub fn risk_score(&self, identity: &str) -> f64 {
        self.risk
            .read()
            .get(identity)
            .map_or(0.0, |entry| entry.lock().score)
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        self.risk
            .read()
            .get(identity)
            .map_or(false, |entry| entry.lock().blocked)
    }

    /// Whether validation for this identity should run one level stricter.
    pub fn should_escalate(&self, identity: &str) -> bool {
        self.risk_score(identity) >= self.config.escalation_threshold
    }

    /// Lift a risk block and reset the score.
    pub fn unblock(&self, identity: &str) {
        if let Some(entry) = self.risk.read().get(identity) {
            let mut risk = entry.lock();
            risk.blocked = false;
            risk.score = 0.0;
        }
    }

    /// Remove sessions idle past the timeout. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.elapsed();
        let idle = self.config.session_idle();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| now.saturating_sub(entry.lock().last_used) <= idle);
        let removed = before - sessions.len();
        self.counters
            .expired
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop risk entries for identities that are unblocked, idle past the
    /// session timeout and carry a negligible score. Returns how many.
    pub fn cleanup_idle_risk(&self) -> usize {
        let now = self.clock.elapsed();
        let idle = self.config.session_idle();
        let mut risk = self.risk.write();
        let before = risk.len();
        risk.retain(|_, entry| {
            let entry = entry.lock();
            entry.blocked
                || entry.score >= RISK_FORGET_BELOW
                || now.saturating_sub(entry.last_update) <= idle
        });
        let removed = before - risk.len();
        if removed > 0 {
            debug!(removed, "idle risk entries reclaimed");
        }
        removed
    }

    /// Drop every session and the risk history of `identity`.
    pub fn forget_identity(&self, identity: &str) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.lock().context.identity != identity);
        self.risk.write().remove(identity);
        before - sessions.len()
    }

    pub fn metrics(&self) -> AccessMetrics {
        let risk = self.risk.read();
        AccessMetrics {
            active_sessions: self.sessions.read().len(),
            sessions_created: self.counters.created.load(Ordering::Relaxed),
            sessions_expired: self.counters.expired.load(Ordering::Relaxed),
            sessions_revoked: self.counters.revoked.load(Ordering::Relaxed),
            tracked_identities: risk.len(),
            blocked_identities: risk.values().filter(|e| e.lock().blocked).count(),
        }
    }

    fn risk_entry(&self, identity: &str) -> Arc<Mutex<RiskEntry>> {
        if let Some(entry) = self.risk.read().get(identity) {
            return Arc::clone(entry);
        }
        Arc::clone(
            self.risk
                .write()
                .entry(identity.to_string())
                .or_default(),
        )
    }
}
