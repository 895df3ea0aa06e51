//! SecurityGateway - the single entry point protecting LLM traffic.
//!
//! `authorize_and_validate` runs the request side of the pipeline and hands
//! back a [`RequestTicket`]. The caller makes the provider call, ideally via
//! [`SecurityGateway::call_provider`], then passes the ticket and response to
//! [`SecurityGateway::finalize_response`]. Every rejection is audited before
//! it is returned, and a ticket that is dropped early still releases its
//! concurrency slot.

use crate::access::{
    AccessManager, NetworkMetadata, RiskUpdate, Role, SecurityContext, SessionToken,
};
use crate::admission::{AdmissionController, AdmissionDecision, AdmissionPermit, BreakerError};
use crate::audit::{
    mask_identity, AuditEventType, AuditLedger, AuditOutcome, AuditRecord, AuditStore,
    IntegrityReport, MemoryAuditStore, Severity, SubjectExport,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{Capabilities, GatewayConfig};
use crate::error::GatewayError;
use crate::metrics::{GatewayMetrics, RequestMetrics};
use crate::policy::{AuthorizationPolicy, DefaultPolicy};
use crate::request::{LlmRequest, LlmResponse};
use crate::validation::{
    ThreatValidator, ValidationLevel, ValidationOutcome, REDACTED_PLACEHOLDER,
};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Risk observed for a permission or token failure.
const PERMISSION_DENIED_RISK: f64 = 0.5;
/// Risk observed for a token-bucket rejection.
const RATE_LIMITED_RISK: f64 = 0.2;
const CONCURRENCY_LIMITED_RISK: f64 = 0.1;
/// Risk observed when the admission controller has blocked the identity.
const ADMISSION_BLOCK_RISK: f64 = 0.6;

/// Who is making a request.
#[derive(Debug, Clone)]
pub enum Subject {
    /// A context from [`SecurityGateway::create_session`] or an adapter.
    Context(SecurityContext),
    /// A signed session token.
    Token(SessionToken),
    /// A bare identity with claimed roles; never authenticated.
    Identity { identity: String, roles: Vec<Role> },
}

impl Subject {
    pub fn bare(identity: impl Into<String>, roles: &[Role]) -> Self {
        Subject::Identity {
            identity: identity.into(),
            roles: roles.to_vec(),
        }
    }

    /// Identity the subject claims, before any verification.
    pub fn claimed_identity(&self) -> &str {
        match self {
            Subject::Context(context) => &context.identity,
            Subject::Token(token) => &token.identity,
            Subject::Identity { identity, .. } => identity,
        }
    }
}

/// Pipeline stages a request passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStage {
    Received,
    PermissionChecked,
    Admitted,
    Validated,
    AuditedRequest,
    ResponseValidated,
    AuditedResponse,
    Released,
    Rejected,
}

/// Stable, caller-facing reason for a rejection.
///
/// Never carries the matched pattern or any other detail that would help an
/// adversary probe the validator; details go to the audit trail only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    PermissionDenied,
    AuthenticationRequired,
    SessionExpired,
    RiskThresholdExceeded,
    RateLimited,
    ConcurrencyLimited,
    TemporarilyBlocked,
    CircuitOpen,
    ContentRejected,
    Timeout,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialReason::PermissionDenied => "permission denied",
            DenialReason::AuthenticationRequired => "authentication required",
            DenialReason::SessionExpired => "session expired",
            DenialReason::RiskThresholdExceeded => "risk threshold exceeded",
            DenialReason::RateLimited => "rate limited",
            DenialReason::ConcurrencyLimited => "concurrency limit exceeded",
            DenialReason::TemporarilyBlocked => "temporarily blocked",
            DenialReason::CircuitOpen => "circuit open",
            DenialReason::ContentRejected => "request rejected by content policy",
            DenialReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why and where a request stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub reason: DenialReason,
    pub retry_after: Option<Duration>,
    pub stages: Vec<RequestStage>,
    /// Audit event describing the rejection, if it was recorded.
    pub audit_event_id: Option<String>,
}

/// Outcome of [`SecurityGateway::authorize_and_validate`].
#[derive(Debug)]
pub enum GatewayDecision {
    Allowed(Box<RequestTicket>),
    /// Retryable: token bucket, concurrency cap or open circuit.
    RateLimited(Rejection),
    Denied(Rejection),
    /// The caller must (re)authenticate.
    Challenge(Rejection),
}

impl GatewayDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, GatewayDecision::Allowed(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            GatewayDecision::Allowed(_) => None,
            GatewayDecision::RateLimited(r)
            | GatewayDecision::Denied(r)
            | GatewayDecision::Challenge(r) => Some(r),
        }
    }

    /// Caller-facing reason; `None` when allowed.
    pub fn reason(&self) -> Option<&'static str> {
        self.rejection().map(|r| r.reason.as_str())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.rejection().and_then(|r| r.retry_after)
    }

    pub fn into_ticket(self) -> Option<RequestTicket> {
        match self {
            GatewayDecision::Allowed(ticket) => Some(*ticket),
            _ => None,
        }
    }

    /// Mark a rejection that gave back a concurrency slot.
    fn released(mut self) -> Self {
        match &mut self {
            GatewayDecision::Allowed(_) => {}
            GatewayDecision::RateLimited(r)
            | GatewayDecision::Denied(r)
            | GatewayDecision::Challenge(r) => r.stages.push(RequestStage::Released),
        }
        self
    }
}

/// An admitted request, holding its concurrency slot until released.
///
/// Pass it to [`SecurityGateway::finalize_response`] or
/// [`SecurityGateway::abort`]. Dropping it instead still frees the slot and
/// folds the request's risk into the identity's score.
pub struct RequestTicket {
    request_id: String,
    context: SecurityContext,
    request: LlmRequest,
    validation: ValidationOutcome,
    stages: Vec<RequestStage>,
    audit_event_id: Option<String>,
    permit: Option<AdmissionPermit>,
    access: Arc<AccessManager>,
    released: bool,
}

impl RequestTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    /// The request to forward; its prompt is the sanitized text.
    pub fn request(&self) -> &LlmRequest {
        &self.request
    }

    pub fn validation(&self) -> &ValidationOutcome {
        &self.validation
    }

    pub fn stages(&self) -> &[RequestStage] {
        &self.stages
    }

    pub fn audit_event_id(&self) -> Option<&str> {
        self.audit_event_id.as_deref()
    }

    fn release(&mut self, observed_risk: f64) -> RiskUpdate {
        self.permit.take();
        self.released = true;
        self.stages.push(RequestStage::Released);
        self.access.update_risk(&self.context.identity, observed_risk)
    }
}

impl fmt::Debug for RequestTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTicket")
            .field("request_id", &self.request_id)
            .field("provider", &self.request.provider)
            .field("stages", &self.stages)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        if !self.released {
            debug!(request_id = %self.request_id, "request ticket dropped before finalization");
            self.release(self.validation.risk_score);
        }
    }
}

/// Outcome of [`SecurityGateway::finalize_response`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizedResponse {
    /// Content safe to return; redacted when `blocked`.
    pub content: String,
    pub blocked: bool,
    pub validation: ValidationOutcome,
    pub stages: Vec<RequestStage>,
    pub audit_event_id: Option<String>,
}

/// What a [`SecurityGateway::cleanup`] pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions_expired: usize,
    /// Identities whose admission state sat idle.
    pub identities_evicted: usize,
    /// Idle risk entries with a negligible score.
    pub risk_entries_evicted: usize,
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    RateLimited,
    Denied,
    Challenge,
}

impl Verdict {
    fn label(self) -> &'static str {
        match self {
            Verdict::RateLimited => "rate_limited",
            Verdict::Denied => "denied",
            Verdict::Challenge => "challenge",
        }
    }
}

/// A rejection on its way to being audited.
struct Denial {
    verdict: Verdict,
    reason: DenialReason,
    event_type: AuditEventType,
    severity: Option<Severity>,
    retry_after: Option<Duration>,
    observed_risk: Option<f64>,
    details: Vec<(&'static str, String)>,
}

impl Denial {
    fn new(verdict: Verdict, reason: DenialReason, event_type: AuditEventType) -> Self {
        Self {
            verdict,
            reason,
            event_type,
            severity: None,
            retry_after: None,
            observed_risk: None,
            details: Vec::new(),
        }
    }

    fn retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    fn risk(mut self, observed: f64) -> Self {
        self.observed_risk = Some(observed);
        self
    }

    fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    fn detail(mut self, key: &'static str, value: impl ToString) -> Self {
        self.details.push((key, value.to_string()));
        self
    }
}

#[derive(Debug, Default)]
struct RequestCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
    rate_limited: AtomicU64,
    challenged: AtomicU64,
    timed_out: AtomicU64,
    completed: AtomicU64,
    responses_blocked: AtomicU64,
    failed: AtomicU64,
}

fn threat_labels(outcome: &ValidationOutcome) -> String {
    outcome
        .threats
        .iter()
        .map(|t| t.label())
        .collect::<Vec<_>>()
        .join(",")
}

/// Composes validation, admission, access and audit into one protocol.
///
/// # Example
///
/// ```rust,ignore
/// use llm_gateway_core::{LlmRequest, LlmResponse, Role, SecurityGateway, Subject};
///
/// let gateway = SecurityGateway::standard("my-signing-secret").await?;
/// let (_, token) = gateway.create_session("alice", &[Role::PowerUser], None).await?;
///
/// let decision = gateway
///     .authorize_and_validate(Subject::Token(token), LlmRequest::new("alice", "Hello", "anthropic"), None)
///     .await;
/// if let Some(ticket) = decision.into_ticket() {
///     let reply = LlmResponse::new("Hi!", std::time::Duration::from_millis(120));
///     let finalized = gateway.finalize_response(ticket, reply).await;
///     println!("{}", finalized.content);
/// }
/// ```
pub struct SecurityGateway {
    config: GatewayConfig,
    validator: ThreatValidator,
    admission: AdmissionController,
    ledger: AuditLedger,
    access: Arc<AccessManager>,
    policy: Box<dyn AuthorizationPolicy>,
    counters: RequestCounters,
}

impl SecurityGateway {
    /// Create a gateway with the standard validation level and every
    /// capability enabled (recommended).
    pub async fn standard(signing_secret: impl Into<String>) -> Result<Self, GatewayError> {
        Self::builder().with_secret(signing_secret).build().await
    }

    /// Create a gateway that validates strictly and requires authenticated
    /// sessions. Maximum security for regulated industries.
    pub async fn strict(signing_secret: impl Into<String>) -> Result<Self, GatewayError> {
        let mut config = GatewayConfig::default();
        config.capabilities = Capabilities::secure();
        config.validator.default_level = ValidationLevel::Strict;
        config.access.require_authentication = true;
        Self::builder()
            .with_config(config)
            .with_secret(signing_secret)
            .build()
            .await
    }

    /// Create a gateway with minimal validation and basic capabilities.
    /// For development/testing.
    pub async fn permissive(signing_secret: impl Into<String>) -> Result<Self, GatewayError> {
        let mut config = GatewayConfig::default();
        config.capabilities = Capabilities::basic();
        config.validator.default_level = ValidationLevel::Minimal;
        Self::builder()
            .with_config(config)
            .with_secret(signing_secret)
            .build()
            .await
    }

    /// Create a builder for custom gateway configuration.
    pub fn builder() -> SecurityGatewayBuilder {
        SecurityGatewayBuilder::new()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn access(&self) -> &AccessManager {
        &self.access
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Start an authenticated session and sign a token for it.
    pub async fn create_session(
        &self,
        identity: &str,
        roles: &[Role],
        network: Option<NetworkMetadata>,
    ) -> Result<(SecurityContext, SessionToken), GatewayError> {
        let context = self.access.create_context(identity, roles, network);
        let token = self.access.issue_token(&context)?;
        self.audit(
            AuditRecord::new(AuditEventType::SessionCreated, AuditOutcome::Success)
                .identity(identity)
                .ip_address(context.ip_address())
                .meta("session_id", &context.session_id)
                .meta("roles", format!("{:?}", roles)),
        )
        .await;
        Ok((context, token))
    }

    /// End a session. Returns whether it was live.
    pub async fn revoke_session(&self, session_id: &str) -> bool {
        let identity = self.access.context(session_id).ok().map(|c| c.identity);
        let revoked = self.access.revoke(session_id);
        if revoked {
            let mut record =
                AuditRecord::new(AuditEventType::SessionRevoked, AuditOutcome::Success)
                    .meta("session_id", session_id);
            if let Some(identity) = identity {
                record = record.identity(identity);
            }
            self.audit(record).await;
        }
        revoked
    }

    /// Run the request side of the pipeline.
    ///
    /// `timeout` bounds every check; it defaults to the configured request
    /// timeout. A timed-out evaluation releases any slot it had acquired.
    pub async fn authorize_and_validate(
        &self,
        subject: Subject,
        request: LlmRequest,
        timeout: Option<Duration>,
    ) -> GatewayDecision {
        let deadline = timeout.unwrap_or_else(|| self.config.request_timeout());
        let identity = subject.claimed_identity().to_string();
        let provider = request.provider.clone();
        let correlation_id = request.correlation_id.clone();
        let admitted = AtomicBool::new(false);

        match tokio::time::timeout(deadline, self.evaluate(subject, request, &admitted)).await {
            Ok(decision) => decision,
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_requests_total", "decision" => "timeout").increment(1);
                warn!(
                    identity = %mask_identity(&identity),
                    provider = %provider,
                    timeout_ms = deadline.as_millis() as u64,
                    "request evaluation timed out"
                );
                let audit_event_id = self
                    .audit(
                        AuditRecord::new(AuditEventType::RequestTimedOut, AuditOutcome::Failure)
                            .identity(&identity)
                            .target(&provider)
                            .correlation_id(correlation_id.as_deref())
                            .meta("timeout_ms", deadline.as_millis()),
                    )
                    .await;
                // The abandoned evaluation already dropped any slot it held.
                let mut stages = vec![RequestStage::Received, RequestStage::Rejected];
                if admitted.load(Ordering::Acquire) {
                    stages.push(RequestStage::Released);
                }
                GatewayDecision::Denied(Rejection {
                    reason: DenialReason::Timeout,
                    retry_after: None,
                    stages,
                    audit_event_id,
                })
            }
        }
    }

    async fn evaluate(
        &self,
        subject: Subject,
        mut request: LlmRequest,
        admitted: &AtomicBool,
    ) -> GatewayDecision {
        let mut stages = vec![RequestStage::Received];
        let claimed = subject.claimed_identity().to_string();

        let context = match self.resolve(subject) {
            Ok(context) => context,
            Err(denial) => return self.reject(&claimed, None, &request, stages, denial).await,
        };
        let identity = context.identity.clone();
        let ip = context.ip_address().map(str::to_string);
        let ip = ip.as_deref();

        if !context.authenticated && self.config.access.require_authentication {
            let denial = Denial::new(
                Verdict::Challenge,
                DenialReason::AuthenticationRequired,
                AuditEventType::AuthenticationRequired,
            );
            return self.reject(&identity, ip, &request, stages, denial).await;
        }

        if !request.identity.is_empty() && request.identity != identity {
            let denial = Denial::new(
                Verdict::Denied,
                DenialReason::PermissionDenied,
                AuditEventType::PermissionDenied,
            )
            .risk(PERMISSION_DENIED_RISK)
            .detail("detail", "request identity does not match subject");
            return self.reject(&identity, ip, &request, stages, denial).await;
        }

        if self.access.is_blocked(&identity) {
            let denial = Denial::new(
                Verdict::Denied,
                DenialReason::RiskThresholdExceeded,
                AuditEventType::RiskThresholdExceeded,
            )
            .severity(Severity::Warning)
            .detail("risk_score", format!("{:.3}", self.access.risk_score(&identity)));
            return self.reject(&identity, ip, &request, stages, denial).await;
        }

        let policy_denial = match self.policy.authorize(&context, &request).await {
            Ok(decision) if decision.allowed => None,
            Ok(decision) => Some(decision.reason.unwrap_or_default()),
            Err(e) => {
                warn!(error = %e, "authorization policy failed; denying");
                Some("policy error".to_string())
            }
        };
        if let Some(detail) = policy_denial {
            let denial = Denial::new(
                Verdict::Denied,
                DenialReason::PermissionDenied,
                AuditEventType::PermissionDenied,
            )
            .risk(PERMISSION_DENIED_RISK)
            .detail("detail", detail);
            return self.reject(&identity, ip, &request, stages, denial).await;
        }
        stages.push(RequestStage::PermissionChecked);

        if let Some(retry_after) = self.admission.probe_circuit(&request.provider) {
            let denial = Denial::new(
                Verdict::RateLimited,
                DenialReason::CircuitOpen,
                AuditEventType::CircuitOpen,
            )
            .retry_after(retry_after);
            return self.reject(&identity, ip, &request, stages, denial).await;
        }

        let permit = match self.admission.check(&identity, &request.scope, request.cost) {
            AdmissionDecision::Admitted(permit) => permit,
            AdmissionDecision::RateLimited {
                retry_after,
                available,
            } => {
                let denial = Denial::new(
                    Verdict::RateLimited,
                    DenialReason::RateLimited,
                    AuditEventType::RateLimited,
                )
                .retry_after(retry_after)
                .risk(RATE_LIMITED_RISK)
                .detail("scope", &request.scope)
                .detail("available", format!("{:.2}", available));
                return self.reject(&identity, ip, &request, stages, denial).await;
            }
            AdmissionDecision::ConcurrencyLimited { limit } => {
                let denial = Denial::new(
                    Verdict::RateLimited,
                    DenialReason::ConcurrencyLimited,
                    AuditEventType::ConcurrencyLimited,
                )
                .risk(CONCURRENCY_LIMITED_RISK)
                .detail("limit", limit);
                return self.reject(&identity, ip, &request, stages, denial).await;
            }
            AdmissionDecision::Blocked { retry_after } => {
                let denial = Denial::new(
                    Verdict::Denied,
                    DenialReason::TemporarilyBlocked,
                    AuditEventType::IdentityBlocked,
                )
                .retry_after(retry_after)
                .risk(ADMISSION_BLOCK_RISK);
                return self.reject(&identity, ip, &request, stages, denial).await;
            }
        };
        stages.push(RequestStage::Admitted);
        admitted.store(true, Ordering::Release);

        let mut level = self.validator.default_level();
        if self.access.should_escalate(&identity) {
            level = level.escalate();
        }
        let validation = self.validator.validate_input(&request.prompt, level);
        if !validation.is_valid {
            let denial = Denial::new(
                Verdict::Denied,
                DenialReason::ContentRejected,
                AuditEventType::ValidationFailed,
            )
            .risk(validation.risk_score)
            .detail("level", level.as_str())
            .detail("risk_score", format!("{:.3}", validation.risk_score))
            .detail("threats", threat_labels(&validation));
            let decision = self.reject(&identity, ip, &request, stages, denial).await;
            drop(permit);
            return decision.released();
        }
        stages.push(RequestStage::Validated);

        let request_id = uuid::Uuid::new_v4().to_string();
        let event_type = if validation.sanitized {
            AuditEventType::InputSanitized
        } else {
            AuditEventType::RequestAdmitted
        };
        let audit_event_id = self
            .audit(
                AuditRecord::new(event_type, AuditOutcome::Success)
                    .identity(&identity)
                    .target(&request.provider)
                    .correlation_id(request.correlation_id.as_deref())
                    .ip_address(ip)
                    .meta("request_id", &request_id)
                    .meta("model", &request.model)
                    .meta("level", level.as_str())
                    .meta("risk_score", format!("{:.3}", validation.risk_score))
                    .meta("threats", threat_labels(&validation)),
            )
            .await;
        stages.push(RequestStage::AuditedRequest);

        if let Some(text) = &validation.sanitized_text {
            request.prompt = text.clone();
        }

        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_requests_total", "decision" => "allowed").increment(1);
        metrics::histogram!("gateway_request_risk_score").record(validation.risk_score);
        debug!(
            request_id = %request_id,
            identity = %mask_identity(&identity),
            provider = %request.provider,
            level = level.as_str(),
            sanitized = validation.sanitized,
            "request admitted"
        );

        GatewayDecision::Allowed(Box::new(RequestTicket {
            request_id,
            context,
            request,
            validation,
            stages,
            audit_event_id,
            permit: Some(permit),
            access: Arc::clone(&self.access),
            released: false,
        }))
    }

    /// Turn a subject into a live context.
    fn resolve(&self, subject: Subject) -> Result<SecurityContext, Denial> {
        match subject {
            Subject::Context(context) if context.authenticated => {
                let live = self
                    .access
                    .context(&context.session_id)
                    .map_err(|e| session_denial(&e))?;
                if live.identity != context.identity {
                    return Err(Denial::new(
                        Verdict::Denied,
                        DenialReason::PermissionDenied,
                        AuditEventType::PermissionDenied,
                    )
                    .risk(PERMISSION_DENIED_RISK)
                    .detail("detail", "context does not belong to session"));
                }
                Ok(live)
            }
            // Unauthenticated contexts get their permissions re-derived from roles.
            Subject::Context(context) => {
                let mut fresh = self
                    .access
                    .anonymous_context(&context.identity, &context.roles);
                fresh.network = context.network;
                Ok(fresh)
            }
            Subject::Token(token) => self.access.resume(&token).map_err(|e| session_denial(&e)),
            Subject::Identity { identity, roles } => {
                Ok(self.access.anonymous_context(&identity, &roles))
            }
        }
    }

    /// Audit a rejection, fold its risk into the identity and build the decision.
    async fn reject(
        &self,
        identity: &str,
        ip: Option<&str>,
        request: &LlmRequest,
        mut stages: Vec<RequestStage>,
        denial: Denial,
    ) -> GatewayDecision {
        let last_stage = stages.last().copied().unwrap_or(RequestStage::Received);
        stages.push(RequestStage::Rejected);

        let outcome = match denial.verdict {
            Verdict::Challenge => AuditOutcome::Failure,
            Verdict::RateLimited | Verdict::Denied => AuditOutcome::Denied,
        };
        let mut record = AuditRecord::new(denial.event_type, outcome)
            .identity(identity)
            .target(&request.provider)
            .correlation_id(request.correlation_id.as_deref())
            .ip_address(ip)
            .meta("reason", denial.reason)
            .meta("stage", format!("{:?}", last_stage));
        if let Some(severity) = denial.severity {
            record = record.severity(severity);
        }
        if let Some(retry_after) = denial.retry_after {
            record = record.meta("retry_after_ms", retry_after.as_millis());
        }
        for (key, value) in &denial.details {
            record = record.meta(key, value);
        }
        let audit_event_id = self.audit(record).await;

        if let Some(observed) = denial.observed_risk {
            let update = self.access.update_risk(identity, observed);
            self.audit_risk_block(identity, update, request.correlation_id.as_deref())
                .await;
        }

        let counter = match denial.verdict {
            Verdict::RateLimited => &self.counters.rate_limited,
            Verdict::Denied => &self.counters.denied,
            Verdict::Challenge => &self.counters.challenged,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_requests_total", "decision" => denial.verdict.label())
            .increment(1);
        info!(
            identity = %mask_identity(identity),
            provider = %request.provider,
            reason = %denial.reason,
            "request rejected"
        );

        let rejection = Rejection {
            reason: denial.reason,
            retry_after: denial.retry_after,
            stages,
            audit_event_id,
        };
        match denial.verdict {
            Verdict::RateLimited => GatewayDecision::RateLimited(rejection),
            Verdict::Denied => GatewayDecision::Denied(rejection),
            Verdict::Challenge => GatewayDecision::Challenge(rejection),
        }
    }

    /// Run a provider call through the provider's circuit breaker.
    pub async fn call_provider<T, E, F>(
        &self,
        ticket: &RequestTicket,
        call: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let provider = &ticket.request.provider;
        let result = self.admission.call_through_breaker(provider, call).await;
        if let Err(BreakerError::Open { retry_after }) = &result {
            self.audit(
                AuditRecord::new(AuditEventType::CircuitOpen, AuditOutcome::Denied)
                    .identity(&ticket.context.identity)
                    .target(provider)
                    .correlation_id(ticket.request.correlation_id.as_deref())
                    .meta("request_id", &ticket.request_id)
                    .meta("retry_after_ms", retry_after.as_millis()),
            )
            .await;
        }
        result
    }

    /// Run the response side of the pipeline and release the ticket.
    pub async fn finalize_response(
        &self,
        mut ticket: RequestTicket,
        response: LlmResponse,
    ) -> FinalizedResponse {
        self.admission.record_latency(response.latency);
        metrics::histogram!("gateway_provider_latency_seconds")
            .record(response.latency.as_secs_f64());

        let validation = if self.config.capabilities.response_validation {
            self.validator.validate_output(&response.content)
        } else {
            ValidationOutcome::clean(&response.content, ticket.validation.level)
        };
        ticket.stages.push(RequestStage::ResponseValidated);

        let blocked = !validation.is_valid;
        let content = match &validation.sanitized_text {
            Some(text) => text.clone(),
            None if blocked => REDACTED_PLACEHOLDER.to_string(),
            None => response.content.clone(),
        };

        let record = if blocked {
            AuditRecord::new(AuditEventType::ResponseBlocked, AuditOutcome::Denied)
                .meta("threats", threat_labels(&validation))
                .meta("risk_score", format!("{:.3}", validation.risk_score))
        } else {
            AuditRecord::new(AuditEventType::RequestCompleted, AuditOutcome::Success)
        };
        let mut record = record
            .identity(&ticket.context.identity)
            .target(&ticket.request.provider)
            .correlation_id(ticket.request.correlation_id.as_deref())
            .ip_address(ticket.context.ip_address())
            .meta("request_id", &ticket.request_id)
            .meta("latency_ms", response.latency.as_millis());
        if let Some(usage) = response.usage {
            record = record.meta("total_tokens", usage.total());
        }
        let audit_event_id = self.audit(record).await;
        ticket.stages.push(RequestStage::AuditedResponse);

        if blocked {
            self.counters.responses_blocked.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %ticket.request_id,
                provider = %ticket.request.provider,
                "response blocked"
            );
        } else {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        }

        let observed = ticket.validation.risk_score.max(validation.risk_score);
        let update = ticket.release(observed);
        self.audit_risk_block(
            &ticket.context.identity,
            update,
            ticket.request.correlation_id.as_deref(),
        )
        .await;

        FinalizedResponse {
            content,
            blocked,
            validation,
            stages: std::mem::take(&mut ticket.stages),
            audit_event_id,
        }
    }

    /// Release a ticket whose provider call failed or was abandoned.
    pub async fn abort(&self, mut ticket: RequestTicket, detail: &str) -> Vec<RequestStage> {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.audit(
            AuditRecord::new(AuditEventType::RequestFailed, AuditOutcome::Error)
                .identity(&ticket.context.identity)
                .target(&ticket.request.provider)
                .correlation_id(ticket.request.correlation_id.as_deref())
                .meta("request_id", &ticket.request_id)
                .meta("detail", detail),
        )
        .await;

        let update = ticket.release(ticket.validation.risk_score);
        self.audit_risk_block(
            &ticket.context.identity,
            update,
            ticket.request.correlation_id.as_deref(),
        )
        .await;
        std::mem::take(&mut ticket.stages)
    }

    async fn audit_risk_block(&self, identity: &str, update: RiskUpdate, correlation_id: Option<&str>) {
        if update.newly_blocked {
            self.audit(
                AuditRecord::new(AuditEventType::RiskThresholdExceeded, AuditOutcome::Denied)
                    .identity(identity)
                    .correlation_id(correlation_id)
                    .meta("risk_score", format!("{:.3}", update.score)),
            )
            .await;
        }
    }

    /// Append to the ledger. Failures are logged, never surfaced to the
    /// request path.
    async fn audit(&self, record: AuditRecord) -> Option<String> {
        match self.ledger.append(record).await {
            Ok(event_id) => Some(event_id),
            Err(e) => {
                error!(error = %e, "audit write failed");
                None
            }
        }
    }

    pub fn get_metrics(&self) -> GatewayMetrics {
        let c = &self.counters;
        GatewayMetrics {
            requests: RequestMetrics {
                allowed: c.allowed.load(Ordering::Relaxed),
                denied: c.denied.load(Ordering::Relaxed),
                rate_limited: c.rate_limited.load(Ordering::Relaxed),
                challenged: c.challenged.load(Ordering::Relaxed),
                timed_out: c.timed_out.load(Ordering::Relaxed),
                completed: c.completed.load(Ordering::Relaxed),
                responses_blocked: c.responses_blocked.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
            },
            admission: self.admission.metrics(),
            validation: self.validator.metrics(),
            audit: self.ledger.metrics(),
            access: self.access.metrics(),
        }
    }

    /// Every stored audit event about `identity`.
    pub async fn export_subject_data(&self, identity: &str) -> Result<SubjectExport, GatewayError> {
        self.ledger.export_subject(identity).await
    }

    /// Erase `identity` from the audit trail and drop its sessions and risk
    /// history. Returns the number of audit events erased.
    pub async fn erase_subject_data(&self, identity: &str) -> Result<usize, GatewayError> {
        let erased = self.ledger.erase_subject(identity).await?;
        let sessions = self.access.forget_identity(identity);
        info!(
            identity = %mask_identity(identity),
            erased,
            sessions,
            "subject data erased"
        );
        Ok(erased)
    }

    pub async fn verify_integrity(&self, range: Range<u64>) -> Result<IntegrityReport, GatewayError> {
        self.ledger.verify_integrity(range).await
    }

    pub async fn purge_expired(&self) -> Result<usize, GatewayError> {
        self.ledger.purge_expired().await
    }

    /// Reclaim expired sessions, idle admission state and idle risk entries.
    pub fn cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            sessions_expired: self.access.cleanup_expired(),
            identities_evicted: self.admission.cleanup_idle(self.config.access.session_idle()),
            risk_entries_evicted: self.access.cleanup_idle_risk(),
        };
        debug!(
            sessions_expired = report.sessions_expired,
            identities_evicted = report.identities_evicted,
            risk_entries_evicted = report.risk_entries_evicted,
            "cleanup pass finished"
        );
        report
    }

    pub async fn flush(&self) -> Result<usize, GatewayError> {
        self.ledger.flush().await
    }

    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.ledger.shutdown().await
    }
}

fn session_denial(error: &GatewayError) -> Denial {
    match error {
        GatewayError::ExpiredSessionToken(_)
        | GatewayError::SessionExpired(_)
        | GatewayError::UnknownSession(_) => Denial::new(
            Verdict::Challenge,
            DenialReason::SessionExpired,
            AuditEventType::AuthenticationRequired,
        )
        .detail("detail", error),
        _ => Denial::new(
            Verdict::Denied,
            DenialReason::PermissionDenied,
            AuditEventType::PermissionDenied,
        )
        .risk(PERMISSION_DENIED_RISK)
        .detail("detail", "invalid session token"),
    }
}

/// Builder for creating custom gateway configurations.
pub struct SecurityGatewayBuilder {
    config: GatewayConfig,
    secret: Option<String>,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn AuditStore>>,
    policy: Option<Box<dyn AuthorizationPolicy>>,
}

impl SecurityGatewayBuilder {
    fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            secret: None,
            clock: None,
            store: None,
            policy: None,
        }
    }

    /// Set the signing secret (required unless the config carries one).
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the audit store. Defaults to a volatile in-memory store.
    pub fn with_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set a custom authorization policy.
    pub fn with_policy(mut self, policy: Box<dyn AuthorizationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the gateway, resuming the audit chain from the store's tail.
    pub async fn build(self) -> Result<SecurityGateway, GatewayError> {
        let mut config = self.config;
        if let Some(secret) = self.secret {
            config.signing_secret = secret;
        }
        config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let store = self.store.unwrap_or_else(|| {
            debug!("no audit store configured; using in-memory store");
            Arc::new(MemoryAuditStore::new())
        });
        let capabilities = config.capabilities;

        let ledger = AuditLedger::open(
            config.audit.clone(),
            &capabilities,
            &config.signing_secret,
            store,
            Arc::clone(&clock),
        )
        .await?;
        let validator = ThreatValidator::new(config.validator.clone(), capabilities.result_cache);
        let admission = AdmissionController::new(
            config.admission.clone(),
            Arc::clone(&clock),
            capabilities.adaptive_throttling,
        );
        let access = Arc::new(AccessManager::new(
            config.access.clone(),
            &config.signing_secret,
            clock,
        ));

        info!(
            level = config.validator.default_level.as_str(),
            capabilities = ?capabilities,
            "security gateway ready"
        );

        Ok(SecurityGateway {
            validator,
            admission,
            ledger,
            access,
            policy: self.policy.unwrap_or_else(|| Box::new(DefaultPolicy)),
            counters: RequestCounters::default(),
            config,
        })
    }
}
