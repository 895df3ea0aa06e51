//! Request and response shapes exchanged with the calling adapter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Rate-limit scope used when a request names none.
pub const DEFAULT_SCOPE: &str = "default";

/// An outbound LLM request as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Caller identity. When set, it must match the resolved context.
    pub identity: String,
    pub prompt: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Groups related audit events across requests.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Token-bucket scope.
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Tokens consumed from the scope's bucket.
    #[serde(default = "default_cost")]
    pub cost: f64,
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_cost() -> f64 {
    1.0
}

impl LlmRequest {
    pub fn new(
        identity: impl Into<String>,
        prompt: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            prompt: prompt.into(),
            provider: provider.into(),
            model: String::new(),
            parameters: BTreeMap::new(),
            correlation_id: None,
            scope: default_scope(),
            cost: default_cost(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Whether the caller asked for a streamed response.
    pub fn is_streaming(&self) -> bool {
        matches!(self.parameters.get("stream"), Some(serde_json::Value::Bool(true)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// A provider response handed back for finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// Provider call latency; feeds adaptive throttling.
    pub latency: Duration,
}

impl LlmResponse {
    pub fn new(content: impl Into<String>, latency: Duration) -> Self {
        Self {
            content: content.into(),
            usage: None,
            latency,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = LlmRequest::new("alice", "hello", "anthropic");
        assert_eq!(request.scope, DEFAULT_SCOPE);
        assert_eq!(request.cost, 1.0);
        assert!(!request.is_streaming());

        let streaming = request.with_parameter("stream", serde_json::Value::Bool(true));
        assert!(streaming.is_streaming());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: LlmRequest = serde_json::from_str(
            r#"{"identity":"u1","prompt":"hi","provider":"openai","model":"gpt-4o"}"#,
        )
        .unwrap();
        assert_eq!(request.scope, DEFAULT_SCOPE);
        assert_eq!(request.cost, 1.0);
        assert!(request.correlation_id.is_none());
    }

    #[test]
    fn test_usage_total() {
        let response = LlmResponse::new("ok", Duration::from_millis(20)).with_usage(10, 32);
        assert_eq!(response.usage.unwrap().total(), 42);
    }
}
