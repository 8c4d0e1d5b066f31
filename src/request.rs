//! Request/response wire contract.
//!
//! Mirrors the ingress/egress JSON schemas: an envelope carrying an opaque
//! payload plus a `payload_schema` discriminator. The payload is kept as raw
//! JSON and decoded lazily when a typed view is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Protocol version accepted on the wire
pub const MPC_VERSION: &str = "1.0";

/// Declared data classification of a request
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Internal,
    Sensitive,
    Pii,
    Confidential,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Public => "public",
            Sensitivity::Internal => "internal",
            Sensitivity::Sensitive => "sensitive",
            Sensitivity::Pii => "pii",
            Sensitivity::Confidential => "confidential",
        }
    }
}

/// Caller's routing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingHint {
    #[default]
    Auto,
    RuleEngine,
    ModelSmall,
    ModelLarge,
    ModelPrivate,
    Hybrid,
}

impl ProcessingHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingHint::Auto => "auto",
            ProcessingHint::RuleEngine => "rule_engine",
            ProcessingHint::ModelSmall => "model_small",
            ProcessingHint::ModelLarge => "model_large",
            ProcessingHint::ModelPrivate => "model_private",
            ProcessingHint::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReturnRoute {
    #[default]
    Sync,
    Async,
}

/// Terminal and intermediate response states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
    Queued,
    Processing,
}

/// Identity of the calling application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub application_id: String,
    pub environment: String,
    pub version: String,
}

/// Per-request processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub processing_hint: ProcessingHint,
    #[serde(default)]
    pub return_route: ReturnRoute,
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_pii_detection: bool,
    #[serde(default = "default_true")]
    pub enable_injection_detection: bool,
}

fn default_true() -> bool {
    true
}

/// Credentials attached to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAuth {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// An inbound processing request.
///
/// Immutable once validated; the payload stays raw until a typed view is
/// required (see [`Request::llm_payload`]).
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub mpc_version: String,
    pub request_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    #[serde(rename = "type")]
    pub request_type: String,
    pub payload_schema: String,
    pub payload: Box<RawValue>,
    pub config: RequestConfig,
    pub auth: RequestAuth,
}

/// Typed view over the `llm.request.v1` payload shape.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmPayload {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl Request {
    /// Decode the opaque payload into the LLM request view.
    pub fn llm_payload(&self) -> Result<LlmPayload, serde_json::Error> {
        serde_json::from_str(self.payload.get())
    }
}

impl LlmPayload {
    /// Estimate total tokens for routing and cost ceilings.
    ///
    /// Rough estimate: ~4 characters per token for English prompt text, plus
    /// the declared completion budget when present.
    pub fn estimate_tokens(&self) -> u32 {
        let prompt_tokens = (self.prompt.len() as f32 / 4.0).ceil() as u32;
        prompt_tokens + self.max_tokens.unwrap_or(0)
    }
}

/// Token accounting for a completed backend call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

/// How the request was processed, attached to every response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub confidence: f64,
    pub fallback_used: bool,
}

/// Security screening outcome attached to every response
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SecurityFlags {
    pub has_pii: bool,
    pub injection_detected: bool,
}

/// Successful processing result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub response: String,
    pub tokens: TokenUsage,
}

/// Stable error body for failed requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// An outbound response. Created once per request; immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub mpc_version: String,
    pub request_id: String,
    pub response_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub processing: ProcessingMeta,
    pub security_flags: SecurityFlags,
}

impl Response {
    /// Build a successful response. Exactly `result` is set, never `error`.
    pub fn ok(
        request_id: &str,
        result: ProcessResult,
        processing: ProcessingMeta,
        security_flags: SecurityFlags,
    ) -> Self {
        Self {
            mpc_version: MPC_VERSION.to_string(),
            request_id: request_id.to_string(),
            response_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
            processing,
            security_flags,
        }
    }

    /// Build an error response. Exactly `error` is set, never `result`.
    pub fn error(
        request_id: &str,
        code: ErrorCode,
        message: impl Into<String>,
        processing: ProcessingMeta,
        security_flags: SecurityFlags,
    ) -> Self {
        Self {
            mpc_version: MPC_VERSION.to_string(),
            request_id: request_id.to_string(),
            response_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
            processing,
            security_flags,
        }
    }
}
