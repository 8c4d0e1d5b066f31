//! Backend adapter contract.
//!
//! Every processing engine — rule engine, small/large/private LLM, hybrid
//! chain — sits behind the same three-method adapter. Protocol differences
//! against concrete LLM APIs live entirely outside this crate; the reference
//! adapters here are in-memory.

pub mod stub;

pub use stub::{RuleEngineAdapter, ScriptedAdapter, StaticLlmAdapter};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ErrorCode;
use crate::registry::Backend;
use crate::request::TokenUsage;

/// Typed parameters forwarded to an adapter
#[derive(Debug, Clone, Default)]
pub struct ProcessParams {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Successful adapter invocation
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub response: String,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub confidence: f64,
    pub latency_ms: u64,
}

/// Adapter invocation failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessFailure {
    #[error("backend call exceeded its deadline")]
    Timeout,
    #[error("backend rate limited the request")]
    RateLimited,
    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("backend returned an unusable response: {message}")]
    InvalidResponse { message: String },
}

impl ProcessFailure {
    /// Whether the cascade may retry on another backend.
    ///
    /// Upstream errors only cascade for 5xx-class statuses; a 4xx means the
    /// request itself is at fault and retrying elsewhere won't help.
    pub fn retriable(&self) -> bool {
        match self {
            ProcessFailure::Timeout | ProcessFailure::RateLimited => true,
            ProcessFailure::Upstream { status, .. } => *status >= 500,
            ProcessFailure::InvalidResponse { .. } => false,
        }
    }

    /// Stable wire code when this failure terminates the request
    pub fn code(&self) -> ErrorCode {
        match self {
            ProcessFailure::Timeout => ErrorCode::BackendTimeout,
            ProcessFailure::RateLimited => ErrorCode::RateLimited,
            ProcessFailure::Upstream { .. } | ProcessFailure::InvalidResponse { .. } => {
                ErrorCode::BackendError
            }
        }
    }
}

/// Liveness of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

/// Uniform contract every backend implements.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Descriptor for this backend
    fn describe(&self) -> Backend;

    /// Process a prompt within the given deadline.
    ///
    /// Implementations should give up on their own once `deadline` elapses;
    /// the gateway additionally enforces it from the outside.
    async fn process(
        &self,
        prompt: &str,
        params: &ProcessParams,
        deadline: Duration,
    ) -> Result<ProcessOutput, ProcessFailure>;

    /// Probe this backend for liveness
    async fn health(&self) -> HealthStatus;
}

/// Estimate token count from text (rough: ~4 characters per token)
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f32 / 4.0).ceil() as u32
}
