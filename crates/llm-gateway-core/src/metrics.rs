//! In-process metrics snapshot.
//!
//! Independent of any `metrics` exporter the host installs; every component
//! also emits counters through the `metrics` facade.

use crate::access::AccessMetrics;
use crate::admission::AdmissionMetrics;
use crate::audit::AuditMetrics;
use crate::validation::ValidationMetrics;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayMetrics {
    pub requests: RequestMetrics,
    pub admission: AdmissionMetrics,
    pub validation: ValidationMetrics,
    pub audit: AuditMetrics,
    pub access: AccessMetrics,
}

/// Outcome counts of `authorize_and_validate` and `finalize_response`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestMetrics {
    pub allowed: u64,
    pub denied: u64,
    pub rate_limited: u64,
    pub challenged: u64,
    pub timed_out: u64,
    pub completed: u64,
    pub responses_blocked: u64,
    pub failed: u64,
}
