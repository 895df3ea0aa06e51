//! Threat validation for prompts and provider responses.
//!
//! Input passes through NFKC normalization, then through pattern groups
//! enabled by the [`ValidationLevel`]. Each group contributes a score per
//! [`ThreatKind`]; the overall risk is the maximum. Because a higher level
//! only ever adds checks and lowers the rejection cutoff, anything rejected at
//! one level is rejected at every stricter level.

mod cache;
mod entropy;
mod patterns;
mod sanitize;

pub use sanitize::{FILTERED_PLACEHOLDER, REDACTED_PLACEHOLDER};

use crate::config::ValidatorConfig;
use cache::{CacheKey, ValidationCache};
use parking_lot::Mutex;
use patterns::{
    ThreatPattern, ENCODING_PATTERNS, ESCAPE_HINT, MINIMAL_PATTERNS, PARANOID_PATTERNS,
    RESPONSE_PATTERNS, STANDARD_PATTERNS,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Encoding-attack score floor when decoding reveals a hidden payload.
const DECODED_PAYLOAD_SCORE: f64 = 0.75;
const INVISIBLE_CHAR_SCORE: f64 = 0.55;
const HIGH_ENTROPY_SCORE: f64 = 0.55;
const REPETITION_SCORE: f64 = 0.6;

/// Cache mode tag for response validation; input modes use the level index.
const OUTPUT_MODE: u8 = 4;

/// How thoroughly content is inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Instruction override and jailbreak phrasing, length limit.
    Minimal,
    /// Adds command, SQL and exfiltration idioms.
    Standard,
    /// Adds escape-sequence smuggling and high-entropy tokens.
    Strict,
    /// Adds shell metacharacters and repetition attacks.
    Paranoid,
}

impl ValidationLevel {
    pub const ALL: [ValidationLevel; 4] = [
        ValidationLevel::Minimal,
        ValidationLevel::Standard,
        ValidationLevel::Strict,
        ValidationLevel::Paranoid,
    ];

    /// Risk at or above which content is rejected.
    pub fn reject_threshold(self) -> f64 {
        match self {
            ValidationLevel::Minimal => 0.7,
            ValidationLevel::Standard => 0.65,
            ValidationLevel::Strict => 0.6,
            ValidationLevel::Paranoid => 0.5,
        }
    }

    /// The next stricter level, saturating at `Paranoid`.
    pub fn escalate(self) -> Self {
        match self {
            ValidationLevel::Minimal => ValidationLevel::Standard,
            ValidationLevel::Standard => ValidationLevel::Strict,
            ValidationLevel::Strict | ValidationLevel::Paranoid => ValidationLevel::Paranoid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationLevel::Minimal => "minimal",
            ValidationLevel::Standard => "standard",
            ValidationLevel::Strict => "strict",
            ValidationLevel::Paranoid => "paranoid",
        }
    }

    fn mode(self) -> u8 {
        self as u8
    }
}

/// Category of a detected threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatKind {
    PromptInjection,
    Jailbreak,
    CommandInjection,
    SqlInjection,
    DataExfiltration,
    EncodingAttack,
    HighEntropy,
    ShellMetacharacters,
    RepetitionAttack,
    OversizedInput,
    JailbreakSuccess,
    SecretLeak,
}

impl ThreatKind {
    pub fn label(self) -> &'static str {
        match self {
            ThreatKind::PromptInjection => "prompt injection",
            ThreatKind::Jailbreak => "jailbreak attempt",
            ThreatKind::CommandInjection => "command injection",
            ThreatKind::SqlInjection => "SQL injection",
            ThreatKind::DataExfiltration => "data exfiltration",
            ThreatKind::EncodingAttack => "encoding attack",
            ThreatKind::HighEntropy => "high-entropy content",
            ThreatKind::ShellMetacharacters => "shell metacharacters",
            ThreatKind::RepetitionAttack => "repetition attack",
            ThreatKind::OversizedInput => "oversized input",
            ThreatKind::JailbreakSuccess => "jailbreak success",
            ThreatKind::SecretLeak => "secret leak",
        }
    }
}

/// Result of validating one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    /// Text to forward. Present for accepted content; for rejected responses
    /// it holds the redacted form.
    pub sanitized_text: Option<String>,
    /// `sanitized_text` differs from the original.
    pub sanitized: bool,
    /// Detected categories in declaration order, without duplicates.
    pub threats: Vec<ThreatKind>,
    pub risk_score: f64,
    /// Category-level explanation; never echoes matched content.
    pub reason: Option<String>,
    pub level: ValidationLevel,
}

impl ValidationOutcome {
    pub(crate) fn clean(text: &str, level: ValidationLevel) -> Self {
        Self {
            is_valid: true,
            sanitized_text: Some(text.to_string()),
            sanitized: false,
            threats: Vec::new(),
            risk_score: 0.0,
            reason: None,
            level,
        }
    }
}

/// Counters exposed through the gateway metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub inputs_validated: u64,
    pub outputs_validated: u64,
    pub rejected: u64,
    pub sanitized: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_entries: usize,
    pub cache_bytes: usize,
}

#[derive(Default)]
struct Counters {
    inputs: AtomicU64,
    outputs: AtomicU64,
    rejected: AtomicU64,
    sanitized: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Per-category scores and redactable spans collected during one scan.
#[derive(Default)]
struct Scan {
    scores: BTreeMap<ThreatKind, f64>,
    spans: Vec<Range<usize>>,
}

impl Scan {
    fn record(&mut self, kind: ThreatKind, weight: f64, span: Option<Range<usize>>) {
        let score = self.scores.entry(kind).or_insert(0.0);
        if weight > *score {
            *score = weight;
        }
        if let Some(span) = span {
            self.spans.push(span);
        }
    }

    fn apply(&mut self, patterns: &[ThreatPattern], text: &str) {
        for pattern in patterns {
            for m in pattern.regex.find_iter(text) {
                let span = pattern.redact.then(|| m.range());
                self.record(pattern.kind, pattern.weight, span);
            }
        }
    }

    fn score(&self, kind: ThreatKind) -> f64 {
        self.scores.get(&kind).copied().unwrap_or(0.0)
    }

    fn risk(&self) -> f64 {
        self.scores.values().copied().fold(0.0, f64::max)
    }

    fn threats(&self) -> Vec<ThreatKind> {
        self.scores.keys().copied().collect()
    }

    /// Highest-scoring category; ties resolve to declaration order.
    fn top(&self) -> Option<ThreatKind> {
        let mut best: Option<(ThreatKind, f64)> = None;
        for (&kind, &score) in &self.scores {
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((kind, score));
            }
        }
        best.map(|(kind, _)| kind)
    }

    fn reason(&self) -> Option<String> {
        self.top().map(|kind| format!("{} detected", kind.label()))
    }

    fn merged_spans(&self) -> Vec<Range<usize>> {
        sanitize::merge_spans(self.spans.clone())
    }
}

/// Scores prompts and responses and produces sanitized text.
///
/// Pure with respect to its input: the same text at the same level always
/// yields the same outcome, so outcomes are cacheable by content hash.
pub struct ThreatValidator {
    config: ValidatorConfig,
    cache: Option<Mutex<ValidationCache>>,
    counters: Counters,
}

impl ThreatValidator {
    pub fn new(config: ValidatorConfig, use_cache: bool) -> Self {
        let cache = (use_cache && config.cache_capacity > 0).then(|| {
            Mutex::new(ValidationCache::new(
                config.cache_capacity,
                config.cache_max_bytes,
            ))
        });
        Self {
            config,
            cache,
            counters: Counters::default(),
        }
    }

    pub fn default_level(&self) -> ValidationLevel {
        self.config.default_level
    }

    /// Validate a prompt at `level`.
    pub fn validate_input(&self, text: &str, level: ValidationLevel) -> ValidationOutcome {
        self.counters.inputs.fetch_add(1, Ordering::Relaxed);
        let outcome = self.cached(text, level.mode(), || self.evaluate_input(text, level));
        self.record(&outcome, "input");
        outcome
    }

    /// Validate a provider response.
    ///
    /// A response that claims a jailbreak or leaks credentials or the system
    /// prompt is always invalid, whatever its overall score.
    pub fn validate_output(&self, text: &str) -> ValidationOutcome {
        self.counters.outputs.fetch_add(1, Ordering::Relaxed);
        let outcome = self.cached(text, OUTPUT_MODE, || self.evaluate_output(text));
        self.record(&outcome, "output");
        outcome
    }

    pub fn metrics(&self) -> ValidationMetrics {
        ValidationMetrics {
            inputs_validated: self.counters.inputs.load(Ordering::Relaxed),
            outputs_validated: self.counters.outputs.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            sanitized: self.counters.sanitized.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            cache_entries: self.cache.as_ref().map_or(0, |c| c.lock().len()),
            cache_bytes: self.cache.as_ref().map_or(0, |c| c.lock().bytes()),
        }
    }

    fn cached(
        &self,
        text: &str,
        mode: u8,
        evaluate: impl FnOnce() -> ValidationOutcome,
    ) -> ValidationOutcome {
        let Some(cache) = &self.cache else {
            return evaluate();
        };

        let key = CacheKey {
            digest: Sha256::digest(text.as_bytes()).into(),
            mode,
        };
        if let Some(hit) = cache.lock().get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return hit;
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        // Evaluate without holding the lock; a concurrent miss on the same key
        // computes the same value.
        let outcome = evaluate();
        cache.lock().insert(key, outcome.clone());
        outcome
    }

    fn record(&self, outcome: &ValidationOutcome, direction: &'static str) {
        if !outcome.is_valid {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_validation_rejected_total", "direction" => direction)
                .increment(1);
        }
        if outcome.sanitized {
            self.counters.sanitized.fetch_add(1, Ordering::Relaxed);
        }
        for kind in &outcome.threats {
            metrics::counter!(
                "gateway_threats_detected_total",
                "direction" => direction,
                "kind" => kind.label()
            )
            .increment(1);
        }
    }

    fn evaluate_input(&self, text: &str, level: ValidationLevel) -> ValidationOutcome {
        if text.chars().count() > self.config.max_input_chars {
            return ValidationOutcome {
                is_valid: false,
                sanitized_text: None,
                sanitized: false,
                threats: vec![ThreatKind::OversizedInput],
                risk_score: 1.0,
                reason: Some(format!("{} detected", ThreatKind::OversizedInput.label())),
                level,
            };
        }

        let normalized = sanitize::normalize(text);
        let norm = normalized.text.as_str();
        let mut scan = Scan::default();

        scan.apply(&MINIMAL_PATTERNS, norm);
        if level >= ValidationLevel::Standard {
            scan.apply(&STANDARD_PATTERNS, norm);
        }
        if level >= ValidationLevel::Strict {
            scan.apply(&ENCODING_PATTERNS, norm);
            if normalized.had_invisible {
                scan.record(ThreatKind::EncodingAttack, INVISIBLE_CHAR_SCORE, None);
            }
            scan_decoded(&mut scan, norm);
            for span in entropy::high_entropy_tokens(
                norm,
                self.config.entropy_min_token,
                self.config.entropy_threshold,
            ) {
                scan.record(ThreatKind::HighEntropy, HIGH_ENTROPY_SCORE, Some(span));
            }
        }
        if level >= ValidationLevel::Paranoid {
            scan.apply(&PARANOID_PATTERNS, norm);
            if let Some(span) = entropy::repeated_run(
                norm,
                entropy::MIN_REPEAT_SPAN,
                entropy::MIN_REPEAT_COUNT,
            ) {
                scan.record(ThreatKind::RepetitionAttack, REPETITION_SCORE, Some(span));
            }
        }

        if scan.scores.is_empty() {
            return ValidationOutcome::clean(text, level);
        }

        let risk = scan.risk();
        let mut outcome = ValidationOutcome {
            is_valid: false,
            sanitized_text: None,
            sanitized: false,
            threats: scan.threats(),
            risk_score: risk,
            reason: scan.reason(),
            level,
        };
        if risk >= level.reject_threshold() {
            return outcome;
        }

        if level == ValidationLevel::Minimal {
            // Minimal only reports; sub-threshold findings pass unchanged.
            outcome.is_valid = true;
            outcome.sanitized_text = Some(text.to_string());
        } else if self.config.allow_sanitization {
            let cleaned = sanitize::sanitize(norm, &scan.merged_spans(), level);
            outcome.is_valid = true;
            outcome.sanitized = cleaned != text;
            outcome.sanitized_text = Some(cleaned);
        }
        outcome
    }

    fn evaluate_output(&self, text: &str) -> ValidationOutcome {
        let level = self.config.default_level;
        let normalized = sanitize::normalize(text);
        let norm = normalized.text.as_str();

        let mut scan = Scan::default();
        scan.apply(&RESPONSE_PATTERNS, norm);
        let response_hit = !scan.scores.is_empty();
        scan.apply(&MINIMAL_PATTERNS, norm);

        if scan.scores.is_empty() {
            return ValidationOutcome::clean(text, level);
        }

        let risk = scan.risk();
        let is_valid = !response_hit && risk < level.reject_threshold();
        let (sanitized_text, sanitized) = if is_valid {
            (Some(text.to_string()), false)
        } else {
            let redacted =
                sanitize::replace_spans(norm, &scan.merged_spans(), REDACTED_PLACEHOLDER);
            (Some(redacted), true)
        };

        ValidationOutcome {
            is_valid,
            sanitized_text,
            sanitized,
            threats: scan.threats(),
            risk_score: risk,
            reason: scan.reason(),
            level,
        }
    }
}

/// Decode escape sequences and rescan. Findings that only appear after
/// decoding count as an encoding attack at no less than
/// [`DECODED_PAYLOAD_SCORE`].
fn scan_decoded(scan: &mut Scan, text: &str) {
    if !ESCAPE_HINT.is_match(text) {
        return;
    }
    let decoded = sanitize::decode_escapes(text);
    if decoded == text {
        return;
    }
    let decoded = sanitize::normalize(&decoded).text;

    let mut hidden = Scan::default();
    hidden.apply(&MINIMAL_PATTERNS, &decoded);
    hidden.apply(&STANDARD_PATTERNS, &decoded);

    for (&kind, &score) in &hidden.scores {
        if score > scan.score(kind) {
            scan.record(kind, score, None);
            scan.record(
                ThreatKind::EncodingAttack,
                score.max(DECODED_PAYLOAD_SCORE),
                None,
            );
        }
    }
}
