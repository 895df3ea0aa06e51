//! Pluggable authorization decisions.

use crate::access::{Permission, SecurityContext};
use crate::error::GatewayError;
use crate::request::LlmRequest;
use async_trait::async_trait;

/// Result of a policy authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Internal reason, recorded in the audit trail only.
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// Create an "allowed" decision.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Create a "denied" decision with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Authorization policy consulted for every request.
///
/// Implement this trait to replace the permission table check, e.g. to
/// restrict models per role or consult an external entitlement service.
/// Returning an error denies the request.
#[async_trait]
pub trait AuthorizationPolicy: Send + Sync {
    async fn authorize(
        &self,
        context: &SecurityContext,
        request: &LlmRequest,
    ) -> Result<PolicyDecision, GatewayError>;
}

/// Requires `LlmQuery`, the provider's permission, and `LlmStream` for
/// streamed requests.
pub struct DefaultPolicy;

#[async_trait]
impl AuthorizationPolicy for DefaultPolicy {
    async fn authorize(
        &self,
        context: &SecurityContext,
        request: &LlmRequest,
    ) -> Result<PolicyDecision, GatewayError> {
        let mut required = vec![
            Permission::LlmQuery,
            Permission::for_provider(&request.provider),
        ];
        if request.is_streaming() {
            required.push(Permission::LlmStream);
        }

        match required.into_iter().find(|p| !context.has_permission(*p)) {
            Some(missing) => Ok(PolicyDecision::deny(format!("missing permission {:?}", missing))),
            None => Ok(PolicyDecision::allow()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{permissions_for, Role};
    use chrono::Utc;

    fn context(roles: &[Role]) -> SecurityContext {
        SecurityContext {
            identity: "u1".to_string(),
            session_id: "s1".to_string(),
            roles: roles.to_vec(),
            permissions: permissions_for(roles),
            network: None,
            risk_score: 0.0,
            authenticated: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_without_provider_grant_is_denied() {
        let decision = DefaultPolicy
            .authorize(&context(&[Role::User]), &LlmRequest::new("u1", "hi", "anthropic"))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("ProviderAnthropic"));
    }

    #[tokio::test]
    async fn test_power_user_allowed() {
        let decision = DefaultPolicy
            .authorize(&context(&[Role::PowerUser]), &LlmRequest::new("u1", "hi", "anthropic"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(decision.reason.is_none());
    }

    #[tokio::test]
    async fn test_streaming_needs_stream_permission() {
        let request = LlmRequest::new("u1", "hi", "local")
            .with_parameter("stream", serde_json::Value::Bool(true));
        let mut ctx = context(&[Role::User]);
        ctx.permissions.insert(Permission::ProviderLocal);
        assert!(!DefaultPolicy.authorize(&ctx, &request).await.unwrap().allowed);

        ctx.permissions.insert(Permission::LlmStream);
        assert!(DefaultPolicy.authorize(&ctx, &request).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_auditor_cannot_query() {
        let decision = DefaultPolicy
            .authorize(&context(&[Role::Auditor]), &LlmRequest::new("u1", "hi", "openai"))
            .await
            .unwrap();
        assert!(!decision.allowed);
    }
}
