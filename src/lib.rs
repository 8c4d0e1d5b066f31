//! Security-aware gateway core for LLM traffic.
//!
//! Provides comprehensive control over AI requests including:
//! - Request contract validation (envelope + registered payload schemas)
//! - Bearer-token authentication and RBAC/ABAC authorization
//! - PII detection, redaction/tokenization, and PII-aware routing
//! - Prompt injection detection
//! - Cost-based backend selection with cascade fallback
//! - A security event pipeline: risk scoring, anomaly detection,
//!   durable storage, and alerting
//! - An append-only audit trail
//!
//! The wire transport, concrete LLM API adapters, and dashboards are
//! external collaborators; this crate is the request-path engine and the
//! event pipeline behind them.

pub mod audit;
pub mod auth;
pub mod backends;
pub mod config;
pub mod detection;
pub mod error;
pub mod gateway;
pub mod hash;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod router;
pub mod validate;

pub use audit::{AuditEventType, AuditLog, AuditRecord};
pub use auth::{Authorizer, Claims, Permission, Principal, Role, TokenService};
pub use config::{GatewayConfig, GatewayConfigJson};
pub use error::{ErrorCode, GatewayError};
pub use gateway::Gateway;
pub use pipeline::{
    AiEvent, AnomalyDetector, AnomalySeverity, AnomalyType, EventPipeline, EventProcessor,
    EventStorage, RiskLevel,
};
pub use registry::{Backend, BackendRegistry, BackendType, Capability};
pub use request::{Request, Response, ResponseStatus, Sensitivity};
pub use router::{RouteDecision, RouteQuery, RouterWeights};
