//! Gateway error taxonomy and the stable machine-readable code set.

use serde::{Deserialize, Serialize};

/// Stable, machine-readable error codes surfaced at the API boundary.
///
/// These are part of the external contract: codes never change meaning, and
/// clients dispatch on them. Retriable codes are documented as safe to retry
/// with the same `idempotency_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SchemaInvalid,
    ClockSkew,
    AuthInvalid,
    AuthExpired,
    AuthzDenied,
    PiiRoutingBlocked,
    NoBackendAvailable,
    BackendTimeout,
    BackendError,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    /// Get the wire representation of this code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SchemaInvalid => "SCHEMA_INVALID",
            ErrorCode::ClockSkew => "CLOCK_SKEW",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::AuthExpired => "AUTH_EXPIRED",
            ErrorCode::AuthzDenied => "AUTHZ_DENIED",
            ErrorCode::PiiRoutingBlocked => "PII_ROUTING_BLOCKED",
            ErrorCode::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            ErrorCode::BackendTimeout => "BACKEND_TIMEOUT",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether a client may safely retry a request that failed with this code
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::BackendTimeout | ErrorCode::RateLimited | ErrorCode::InternalError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures along the request path.
///
/// Each variant maps to exactly one [`ErrorCode`]. Authentication failures
/// deliberately carry no detail about which check failed; authorization
/// failures carry a human-readable reason under the coarse code.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("schema validation failed at `{field}`: {reason}")]
    Schema { field: String, reason: String },

    #[error("request timestamp is {skew_secs}s from gateway clock (allowed {allowed_secs}s)")]
    ClockSkew { skew_secs: i64, allowed_secs: i64 },

    #[error("authentication failed")]
    AuthInvalid,

    #[error("token expired")]
    AuthExpired,

    #[error("authorization denied: {reason}")]
    AuthzDenied { reason: String },

    #[error("no PII-compatible backend for this request")]
    PiiRoutingBlocked { pii_types: Vec<String> },

    #[error("no backend satisfies the request constraints")]
    NoBackendAvailable,

    #[error("backend `{backend_id}` exceeded the request deadline")]
    BackendTimeout { backend_id: String },

    #[error("backend `{backend_id}` failed: {message}")]
    Backend { backend_id: String, message: String },

    #[error("backend `{backend_id}` rate limited the request")]
    RateLimited { backend_id: String },

    #[error("internal error (correlation {correlation_id})")]
    Internal { correlation_id: String },
}

impl GatewayError {
    /// Map this failure to its stable wire code
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Schema { .. } => ErrorCode::SchemaInvalid,
            GatewayError::ClockSkew { .. } => ErrorCode::ClockSkew,
            GatewayError::AuthInvalid => ErrorCode::AuthInvalid,
            GatewayError::AuthExpired => ErrorCode::AuthExpired,
            GatewayError::AuthzDenied { .. } => ErrorCode::AuthzDenied,
            GatewayError::PiiRoutingBlocked { .. } => ErrorCode::PiiRoutingBlocked,
            GatewayError::NoBackendAvailable => ErrorCode::NoBackendAvailable,
            GatewayError::BackendTimeout { .. } => ErrorCode::BackendTimeout,
            GatewayError::Backend { .. } => ErrorCode::BackendError,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimited,
            GatewayError::Internal { .. } => ErrorCode::InternalError,
        }
    }
}
