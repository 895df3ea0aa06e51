//! Gateway configuration.
//!
//! Every threshold used by the gateway is a named constant below and the
//! default of a config field. The risk cutoffs, EMA weight and block
//! threshold are policy values to be tuned against real traffic; nothing in
//! the code relies on their exact magnitude.

use crate::error::GatewayError;
use crate::validation::ValidationLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides (`LLM_GATEWAY__ADMISSION__BURST=20`).
pub const ENV_PREFIX: &str = "LLM_GATEWAY";

/// Shannon entropy (bits/char) above which a long token looks encoded.
pub const DEFAULT_ENTROPY_THRESHOLD: f64 = 4.5;
/// Shortest token considered for entropy scoring.
pub const DEFAULT_ENTROPY_MIN_TOKEN: usize = 32;
/// Inputs longer than this are rejected outright.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 100_000;

pub const DEFAULT_BURST: f64 = 20.0;
pub const DEFAULT_REFILL_PER_SEC: f64 = 5.0;
pub const DEFAULT_MAX_CONCURRENT: usize = 8;
pub const DEFAULT_SUSPICION_WINDOW_SECS: u64 = 60;
pub const DEFAULT_SUSPICION_THRESHOLD: u32 = 10;
pub const DEFAULT_BLOCK_COOLDOWN_SECS: u64 = 300;
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_RECOVERY_SECS: u64 = 30;
pub const DEFAULT_LATENCY_TARGET_MS: u64 = 2_000;
pub const DEFAULT_LATENCY_EWMA_ALPHA: f64 = 0.2;
pub const DEFAULT_MIN_THROTTLE: f64 = 0.25;

pub const DEFAULT_AUDIT_BATCH_SIZE: usize = 100;
pub const DEFAULT_RETENTION_DAYS: u32 = 90;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1_000;
pub const DEFAULT_FLUSH_RETRIES: u32 = 3;
pub const DEFAULT_FLUSH_BACKOFF_MS: u64 = 50;
pub const DEFAULT_CORRELATION_WINDOW_SECS: u64 = 300;
pub const DEFAULT_CORRELATION_FAILURES: usize = 5;

/// Weight of the newest observation in the risk EMA.
pub const DEFAULT_RISK_EMA_ALPHA: f64 = 0.3;
/// Risk score at which an identity is hard-blocked.
pub const DEFAULT_RISK_BLOCK_THRESHOLD: f64 = 0.85;
/// Risk score at which validation escalates one level.
pub const DEFAULT_RISK_ESCALATION_THRESHOLD: f64 = 0.5;
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 1_800;
pub const DEFAULT_SESSION_TOKEN_TTL_SECS: i64 = 3_600;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Root secret for session tokens, checkpoint signatures and PII salting.
    pub signing_secret: String,
    /// Default deadline for `authorize_and_validate`.
    pub request_timeout_ms: u64,
    pub capabilities: Capabilities,
    pub validator: ValidatorConfig,
    pub admission: AdmissionConfig,
    pub audit: AuditConfig,
    pub access: AccessConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            capabilities: Capabilities::default(),
            validator: ValidatorConfig::default(),
            admission: AdmissionConfig::default(),
            audit: AuditConfig::default(),
            access: AccessConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `LLM_GATEWAY__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let loaded: GatewayConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reject values the components cannot operate with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.signing_secret.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "signing_secret is required".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        self.admission.validate()?;
        self.access.validate()?;
        self.audit.validate()?;
        self.validator.validate()?;
        Ok(())
    }
}

/// Feature toggles resolved once at construction.
///
/// Replaces the BASIC / PERFORMANCE / SECURE / ENTERPRISE operating modes:
/// each preset is just a different set of flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Cache validation outcomes keyed by content hash.
    pub result_cache: bool,
    /// Scale token refill by observed provider latency.
    pub adaptive_throttling: bool,
    /// Mask PII before audit events are hashed.
    pub pii_masking: bool,
    /// Write signed checkpoints every `checkpoint_interval` events.
    pub checkpoints: bool,
    /// Index events by correlation id and detect failure bursts.
    pub correlation: bool,
    /// Scan provider responses before they reach the caller.
    pub response_validation: bool,
}

impl Capabilities {
    pub fn basic() -> Self {
        Self {
            result_cache: false,
            adaptive_throttling: false,
            pii_masking: true,
            checkpoints: false,
            correlation: false,
            response_validation: true,
        }
    }

    pub fn performance() -> Self {
        Self {
            result_cache: true,
            adaptive_throttling: true,
            ..Self::basic()
        }
    }

    pub fn secure() -> Self {
        Self {
            checkpoints: true,
            correlation: true,
            ..Self::basic()
        }
    }

    pub fn enterprise() -> Self {
        Self {
            result_cache: true,
            adaptive_throttling: true,
            pii_masking: true,
            checkpoints: true,
            correlation: true,
            response_validation: true,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::enterprise()
    }
}

/// Threat validator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub default_level: ValidationLevel,
    pub entropy_threshold: f64,
    pub entropy_min_token: usize,
    pub max_input_chars: usize,
    /// Accept sanitized content when risk stays under the level cutoff.
    pub allow_sanitization: bool,
    pub cache_capacity: usize,
    pub cache_max_bytes: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            default_level: ValidationLevel::Standard,
            entropy_threshold: DEFAULT_ENTROPY_THRESHOLD,
            entropy_min_token: DEFAULT_ENTROPY_MIN_TOKEN,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            allow_sanitization: true,
            cache_capacity: 4_096,
            cache_max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ValidatorConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.entropy_threshold <= 0.0 {
            return Err(GatewayError::InvalidConfig(
                "validator.entropy_threshold must be positive".to_string(),
            ));
        }
        if self.max_input_chars == 0 {
            return Err(GatewayError::InvalidConfig(
                "validator.max_input_chars must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Token bucket parameters for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Bucket capacity (burst size).
    pub burst: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

/// Admission controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub burst: f64,
    pub refill_per_sec: f64,
    /// Per-scope overrides of `burst` / `refill_per_sec`.
    pub scopes: HashMap<String, RateLimit>,
    pub max_concurrent: usize,
    pub suspicion_window_secs: u64,
    pub suspicion_threshold: u32,
    pub block_cooldown_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,
    pub latency_target_ms: u64,
    pub latency_ewma_alpha: f64,
    /// Floor for the adaptive refill multiplier.
    pub min_throttle: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            burst: DEFAULT_BURST,
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
            scopes: HashMap::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            suspicion_window_secs: DEFAULT_SUSPICION_WINDOW_SECS,
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            block_cooldown_secs: DEFAULT_BLOCK_COOLDOWN_SECS,
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_recovery_secs: DEFAULT_BREAKER_RECOVERY_SECS,
            latency_target_ms: DEFAULT_LATENCY_TARGET_MS,
            latency_ewma_alpha: DEFAULT_LATENCY_EWMA_ALPHA,
            min_throttle: DEFAULT_MIN_THROTTLE,
        }
    }
}

impl AdmissionConfig {
    /// Bucket parameters for a scope, falling back to the defaults.
    pub fn limit_for(&self, scope: &str) -> RateLimit {
        self.scopes.get(scope).copied().unwrap_or(RateLimit {
            burst: self.burst,
            refill_per_sec: self.refill_per_sec,
        })
    }

    pub fn suspicion_window(&self) -> Duration {
        Duration::from_secs(self.suspicion_window_secs)
    }

    pub fn block_cooldown(&self) -> Duration {
        Duration::from_secs(self.block_cooldown_secs)
    }

    pub fn breaker_recovery(&self) -> Duration {
        Duration::from_secs(self.breaker_recovery_secs)
    }

    pub fn latency_target(&self) -> Duration {
        Duration::from_millis(self.latency_target_ms)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        let limits = std::iter::once((
            "default",
            RateLimit {
                burst: self.burst,
                refill_per_sec: self.refill_per_sec,
            },
        ))
        .chain(self.scopes.iter().map(|(k, v)| (k.as_str(), *v)));

        for (scope, limit) in limits {
            if limit.burst <= 0.0 || limit.refill_per_sec <= 0.0 {
                return Err(GatewayError::InvalidConfig(format!(
                    "admission scope '{}' needs positive burst and refill_per_sec",
                    scope
                )));
            }
        }
        if self.max_concurrent == 0 {
            return Err(GatewayError::InvalidConfig(
                "admission.max_concurrent must be positive".to_string(),
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(GatewayError::InvalidConfig(
                "admission.breaker_failure_threshold must be positive".to_string(),
            ));
        }
        if !(self.latency_ewma_alpha > 0.0 && self.latency_ewma_alpha <= 1.0) {
            return Err(GatewayError::InvalidConfig(
                "admission.latency_ewma_alpha must be in (0, 1]".to_string(),
            ));
        }
        if !(self.min_throttle > 0.0 && self.min_throttle <= 1.0) {
            return Err(GatewayError::InvalidConfig(
                "admission.min_throttle must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Audit ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Buffered events that trigger a flush.
    pub batch_size: usize,
    pub retention_days: u32,
    pub checkpoint_interval: u64,
    pub flush_retries: u32,
    pub flush_backoff_ms: u64,
    pub correlation_window_secs: u64,
    /// Failures of one action under one correlation id that raise an anomaly.
    pub correlation_failure_threshold: usize,
    /// Correlation ids kept in the in-memory index.
    pub correlation_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_AUDIT_BATCH_SIZE,
            retention_days: DEFAULT_RETENTION_DAYS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            flush_retries: DEFAULT_FLUSH_RETRIES,
            flush_backoff_ms: DEFAULT_FLUSH_BACKOFF_MS,
            correlation_window_secs: DEFAULT_CORRELATION_WINDOW_SECS,
            correlation_failure_threshold: DEFAULT_CORRELATION_FAILURES,
            correlation_capacity: 10_000,
        }
    }
}

impl AuditConfig {
    pub fn correlation_window(&self) -> Duration {
        Duration::from_secs(self.correlation_window_secs)
    }

    pub fn flush_backoff(&self) -> Duration {
        Duration::from_millis(self.flush_backoff_ms)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.batch_size == 0 {
            return Err(GatewayError::InvalidConfig(
                "audit.batch_size must be positive".to_string(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(GatewayError::InvalidConfig(
                "audit.checkpoint_interval must be positive".to_string(),
            ));
        }
        if self.correlation_failure_threshold == 0 {
            return Err(GatewayError::InvalidConfig(
                "audit.correlation_failure_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Access manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub ema_alpha: f64,
    pub block_threshold: f64,
    pub escalation_threshold: f64,
    pub session_idle_secs: u64,
    pub token_ttl_secs: i64,
    /// Answer unauthenticated bare identities with a challenge.
    pub require_authentication: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            ema_alpha: DEFAULT_RISK_EMA_ALPHA,
            block_threshold: DEFAULT_RISK_BLOCK_THRESHOLD,
            escalation_threshold: DEFAULT_RISK_ESCALATION_THRESHOLD,
            session_idle_secs: DEFAULT_SESSION_IDLE_SECS,
            token_ttl_secs: DEFAULT_SESSION_TOKEN_TTL_SECS,
            require_authentication: false,
        }
    }
}

impl AccessConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(GatewayError::InvalidConfig(
                "access.ema_alpha must be in (0, 1]".to_string(),
            ));
        }
        for (name, value) in [
            ("block_threshold", self.block_threshold),
            ("escalation_threshold", self.escalation_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GatewayError::InvalidConfig(format!(
                    "access.{} must be in [0, 1]",
                    name
                )));
            }
        }
        if self.token_ttl_secs <= 0 {
            return Err(GatewayError::InvalidConfig(
                "access.token_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
