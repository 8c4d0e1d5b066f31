//! Gateway configuration.
//!
//! The on-disk form ([`GatewayConfigJson`]) uses kebab-case keys and defaults
//! for everything, so a partial config file is always valid. The runtime form
//! ([`GatewayConfig`]) is what components receive. The token secret is NOT
//! part of the config file; it arrives through the environment and never
//! appears in logs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backends::{BackendAdapter, RuleEngineAdapter, StaticLlmAdapter};
use crate::detection::pii::PiiPattern;
use crate::detection::redaction::RedactionStrategy;
use crate::pipeline::anomaly::AnomalyThresholds;
use crate::pipeline::{OverflowPolicy, PipelineConfig};
use crate::registry::Backend;
use crate::router::RouterWeights;

/// Runtime configuration for the gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum accepted request body size in bytes
    pub max_body_bytes: usize,
    /// Accepted clock skew between caller and gateway, in seconds
    pub clock_skew_secs: i64,
    /// TTL of cached idempotent responses
    pub idempotency_ttl: Duration,
    /// Whether routing produces fallbacks beyond the primary
    pub use_cascade: bool,
    /// Maximum fallbacks after the primary
    pub max_fallbacks: usize,
    /// Cascade halts when the remaining deadline is below this slice
    pub min_slice_ms: u64,
    /// Candidate ranking weights
    pub router_weights: RouterWeights,
    /// Applied to prompts with PII before they reach a backend; `None`
    /// forwards the original text (detection only)
    pub redaction: Option<RedactionStrategy>,
    /// Cost ceiling applied when no per-principal entry exists
    pub default_cost_ceiling_usd: f64,
    /// Per-principal cost ceilings keyed by subject
    pub cost_ceilings: HashMap<String, f64>,
    /// Extra PII patterns layered over the built-ins
    pub pii_patterns: Vec<PiiPattern>,
    /// Custom PII type names the patterns may reference
    pub custom_pii_types: Vec<String>,
    /// Anomaly detection thresholds
    pub anomaly: AnomalyThresholds,
    /// Event queue capacity
    pub queue_capacity: usize,
    /// Event queue overflow policy
    pub overflow: OverflowPolicy,
    /// Pattern-analysis cadence in seconds
    pub flush_interval_secs: u64,
    /// Bounded drain deadline on shutdown, in seconds
    pub shutdown_deadline_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 5 * 1024 * 1024,
            clock_skew_secs: 300,
            idempotency_ttl: Duration::from_secs(900),
            use_cascade: true,
            max_fallbacks: 2,
            min_slice_ms: 200,
            router_weights: RouterWeights::default(),
            redaction: None,
            default_cost_ceiling_usd: 5.0,
            cost_ceilings: HashMap::new(),
            pii_patterns: Vec::new(),
            custom_pii_types: Vec::new(),
            anomaly: AnomalyThresholds::default(),
            queue_capacity: 4096,
            overflow: OverflowPolicy::DropOldest,
            flush_interval_secs: 30,
            shutdown_deadline_secs: 5,
        }
    }
}

impl GatewayConfig {
    /// Derive the event pipeline's configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.queue_capacity,
            overflow: self.overflow,
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            ..PipelineConfig::default()
        }
    }
}

/// JSON-serializable configuration, as loaded from disk.
///
/// Field names use kebab-case to match typical YAML/JSON config style; every
/// field has a default so partial files parse.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct GatewayConfigJson {
    pub max_body_bytes: Option<usize>,
    pub clock_skew_secs: Option<i64>,
    pub idempotency_ttl_secs: Option<u64>,
    pub use_cascade: Option<bool>,
    pub max_fallbacks: Option<usize>,
    pub min_slice_ms: Option<u64>,
    pub router_weights: Option<RouterWeights>,
    /// "redact", "mask", "hash", or "tokenize"; absent means detection only
    pub redaction: Option<String>,
    pub default_cost_ceiling_usd: Option<f64>,
    pub cost_ceilings: HashMap<String, f64>,
    pub pii_patterns: Vec<PiiPattern>,
    pub custom_pii_types: Vec<String>,
    pub anomaly: Option<AnomalyThresholds>,
    pub queue_capacity: Option<usize>,
    /// "drop-oldest" or "backpressure"
    pub overflow: Option<String>,
    pub flush_interval_secs: Option<u64>,
    pub shutdown_deadline_secs: Option<u64>,
    /// Backend descriptors plus adapter bindings
    pub backends: Vec<BackendSpec>,
}

impl GatewayConfigJson {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Build the registry entries declared in this config.
    pub fn backend_entries(&self) -> Vec<(Backend, Arc<dyn BackendAdapter>)> {
        self.backends
            .iter()
            .map(|spec| {
                let adapter = spec.build_adapter();
                (spec.descriptor.clone(), adapter)
            })
            .collect()
    }
}

impl From<GatewayConfigJson> for GatewayConfig {
    fn from(json: GatewayConfigJson) -> Self {
        let defaults = GatewayConfig::default();
        let redaction = json
            .redaction
            .as_deref()
            .and_then(|s| s.parse::<RedactionStrategy>().ok());
        let overflow = json
            .overflow
            .as_deref()
            .and_then(|s| s.parse::<OverflowPolicy>().ok())
            .unwrap_or(defaults.overflow);
        Self {
            max_body_bytes: json.max_body_bytes.unwrap_or(defaults.max_body_bytes),
            clock_skew_secs: json.clock_skew_secs.unwrap_or(defaults.clock_skew_secs),
            idempotency_ttl: json
                .idempotency_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idempotency_ttl),
            use_cascade: json.use_cascade.unwrap_or(defaults.use_cascade),
            max_fallbacks: json.max_fallbacks.unwrap_or(defaults.max_fallbacks),
            min_slice_ms: json.min_slice_ms.unwrap_or(defaults.min_slice_ms),
            router_weights: json.router_weights.unwrap_or(defaults.router_weights),
            redaction,
            default_cost_ceiling_usd: json
                .default_cost_ceiling_usd
                .unwrap_or(defaults.default_cost_ceiling_usd),
            cost_ceilings: json.cost_ceilings,
            pii_patterns: json.pii_patterns,
            custom_pii_types: json.custom_pii_types,
            anomaly: json.anomaly.unwrap_or_default(),
            queue_capacity: json.queue_capacity.unwrap_or(defaults.queue_capacity),
            overflow,
            flush_interval_secs: json
                .flush_interval_secs
                .unwrap_or(defaults.flush_interval_secs),
            shutdown_deadline_secs: json
                .shutdown_deadline_secs
                .unwrap_or(defaults.shutdown_deadline_secs),
        }
    }
}

/// A backend descriptor plus the adapter implementation serving it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    #[serde(flatten)]
    pub descriptor: Backend,
    #[serde(default)]
    pub adapter: AdapterSpec,
}

/// Which in-process adapter serves a configured backend.
///
/// Adapters for real LLM APIs live outside this crate and register through
/// [`crate::registry::BackendRegistry`] directly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum AdapterSpec {
    /// Deterministic canned-completion model stand-in
    #[default]
    Static,
    /// Keyword-rule engine with configured (keyword, answer) pairs
    RuleEngine {
        #[serde(default)]
        rules: Vec<RuleSpec>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub keyword: String,
    pub answer: String,
}

impl BackendSpec {
    fn build_adapter(&self) -> Arc<dyn BackendAdapter> {
        match &self.adapter {
            AdapterSpec::Static => Arc::new(StaticLlmAdapter::new(self.descriptor.clone())),
            AdapterSpec::RuleEngine { rules } => Arc::new(RuleEngineAdapter::new(
                self.descriptor.clone(),
                rules
                    .iter()
                    .map(|r| (r.keyword.clone(), r.answer.clone()))
                    .collect(),
            )),
        }
    }
}
