//! # LLM-Gateway-Core
//!
//! Security gateway for traffic between applications and LLM providers.
//!
//! ## Overview
//!
//! Every request passes through a single [`SecurityGateway`] which composes:
//!
//! - **Threat validation**: prompt injection, jailbreak, code/SQL/shell
//!   injection, encoding attacks and secret leakage, at four levels
//! - **Admission control**: per-identity token buckets, concurrency caps,
//!   temporary blocking and per-provider circuit breakers
//! - **Access management**: roles, permissions, signed session tokens and a
//!   per-identity risk score
//! - **Audit ledger**: a hash-chained, PII-masked, tamper-evident trail with
//!   signed checkpoints, subject export/erasure and retention purging
//!
//! Rejections carry a stable reason and never echo what was matched.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use llm_gateway_core::{LlmRequest, LlmResponse, Role, SecurityGateway, Subject};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = SecurityGateway::standard("my-signing-secret").await?;
//!     let (_, token) = gateway.create_session("alice", &[Role::PowerUser], None).await?;
//!
//!     let request = LlmRequest::new("alice", "Hello world", "anthropic");
//!     let decision = gateway
//!         .authorize_and_validate(Subject::Token(token), request, None)
//!         .await;
//!
//!     match decision.into_ticket() {
//!         Some(ticket) => {
//!             let reply = LlmResponse::new("Hi there", Duration::from_millis(120));
//!             let finalized = gateway.finalize_response(ticket, reply).await;
//!             println!("{}", finalized.content);
//!         }
//!         None => println!("rejected"),
//!     }
//!
//!     gateway.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Policy
//!
//! ```rust,ignore
//! use llm_gateway_core::{AuthorizationPolicy, GatewayError, LlmRequest, PolicyDecision, SecurityContext};
//! use async_trait::async_trait;
//!
//! struct NoStreaming;
//!
//! #[async_trait]
//! impl AuthorizationPolicy for NoStreaming {
//!     async fn authorize(
//!         &self,
//!         _context: &SecurityContext,
//!         request: &LlmRequest,
//!     ) -> Result<PolicyDecision, GatewayError> {
//!         if request.is_streaming() {
//!             Ok(PolicyDecision::deny("streaming disabled"))
//!         } else {
//!             Ok(PolicyDecision::allow())
//!         }
//!     }
//! }
//! ```

pub mod access;
pub mod admission;
pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
mod keys;
pub mod metrics;
pub mod policy;
pub mod request;
pub mod telemetry;
pub mod validation;

// Primary exports
pub use access::{AccessManager, NetworkMetadata, Permission, Role, SecurityContext, SessionToken};
pub use admission::{AdmissionController, AdmissionDecision, BreakerError, CircuitState};
pub use audit::{
    AuditEvent, AuditEventType, AuditLedger, AuditOutcome, AuditRecord, AuditStore,
    IntegrityReport, JsonlAuditStore, MemoryAuditStore, Severity, SubjectExport,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use self::config::{Capabilities, GatewayConfig};
pub use error::GatewayError;
pub use gateway::{
    CleanupReport, DenialReason, FinalizedResponse, GatewayDecision, Rejection, RequestStage,
    RequestTicket, SecurityGateway, SecurityGatewayBuilder, Subject,
};
pub use self::metrics::GatewayMetrics;
pub use policy::{AuthorizationPolicy, DefaultPolicy, PolicyDecision};
pub use request::{LlmRequest, LlmResponse, TokenUsage};
pub use validation::{ThreatKind, ThreatValidator, ValidationLevel, ValidationOutcome};
