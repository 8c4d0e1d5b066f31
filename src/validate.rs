//! Request validation.
//!
//! Shape-only validation in two layers: the request envelope is checked
//! against a fixed JSON Schema, then the opaque payload is checked against
//! the schema registered for its `payload_schema` id. No semantic validation
//! of the payload happens here. Temporal validity (clock skew) is the one
//! non-shape check, because stale requests must fail before authentication.

use std::collections::HashMap;

use chrono::Utc;
use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::request::Request;

/// Envelope schema: field presence, enum membership, numeric ranges.
const ENVELOPE_SCHEMA: &str = r#"{
    "$schema": "http://json-schema.org/draft-07/schema#",
    "title": "Gateway Request Envelope",
    "type": "object",
    "required": [
        "mpc_version", "request_id", "timestamp", "source", "type",
        "payload_schema", "payload", "config", "auth"
    ],
    "properties": {
        "mpc_version": { "const": "1.0" },
        "request_id": {
            "type": "string",
            "pattern": "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
        },
        "idempotency_key": { "type": "string", "minLength": 1, "maxLength": 256 },
        "timestamp": { "type": "string", "minLength": 20 },
        "source": {
            "type": "object",
            "required": ["application_id", "environment", "version"],
            "properties": {
                "application_id": { "type": "string", "minLength": 1 },
                "environment": { "type": "string", "minLength": 1 },
                "version": { "type": "string", "minLength": 1 }
            }
        },
        "type": { "const": "process_request" },
        "payload_schema": { "type": "string", "minLength": 1 },
        "payload": { "type": "object" },
        "config": {
            "type": "object",
            "required": ["sensitivity", "timeout_ms"],
            "properties": {
                "sensitivity": {
                    "enum": ["public", "internal", "sensitive", "pii", "confidential"]
                },
                "processing_hint": {
                    "enum": ["auto", "rule_engine", "model_small", "model_large", "model_private", "hybrid"]
                },
                "return_route": { "enum": ["sync", "async"] },
                "timeout_ms": { "type": "integer", "minimum": 1 },
                "enable_pii_detection": { "type": "boolean" },
                "enable_injection_detection": { "type": "boolean" }
            }
        },
        "auth": {
            "type": "object",
            "required": ["token"],
            "properties": {
                "token": { "type": "string", "minLength": 1 },
                "signature": { "type": "string" }
            }
        }
    },
    "additionalProperties": true
}"#;

/// Built-in payload schema for LLM requests
const LLM_REQUEST_V1_SCHEMA: &str = r#"{
    "$schema": "http://json-schema.org/draft-07/schema#",
    "title": "LLM Request Payload v1",
    "type": "object",
    "required": ["model", "prompt"],
    "properties": {
        "model": { "type": "string", "minLength": 1 },
        "prompt": { "type": "string" },
        "max_tokens": { "type": "integer", "minimum": 1 },
        "temperature": { "type": "number", "minimum": 0, "maximum": 2 }
    },
    "additionalProperties": true
}"#;

/// Id of the built-in payload schema
pub const LLM_REQUEST_V1: &str = "llm.request.v1";

/// Validates raw request bodies into typed [`Request`]s.
pub struct RequestValidator {
    envelope: JSONSchema,
    payload_schemas: HashMap<String, JSONSchema>,
    max_body_bytes: usize,
    clock_skew_secs: i64,
}

impl RequestValidator {
    pub fn new(config: &GatewayConfig) -> Self {
        let envelope = compile(ENVELOPE_SCHEMA).expect("envelope schema is valid");
        let mut payload_schemas = HashMap::new();
        payload_schemas.insert(
            LLM_REQUEST_V1.to_string(),
            compile(LLM_REQUEST_V1_SCHEMA).expect("llm.request.v1 schema is valid"),
        );
        Self {
            envelope,
            payload_schemas,
            max_body_bytes: config.max_body_bytes,
            clock_skew_secs: config.clock_skew_secs,
        }
    }

    /// Register an additional payload schema.
    pub fn register_schema(&mut self, id: &str, schema: &Value) -> Result<(), GatewayError> {
        let compiled = JSONSchema::compile(schema).map_err(|e| GatewayError::Schema {
            field: "payload_schema".to_string(),
            reason: format!("schema `{}` does not compile: {}", id, e),
        })?;
        self.payload_schemas.insert(id.to_string(), compiled);
        Ok(())
    }

    /// Registered payload schema ids
    pub fn schema_ids(&self) -> Vec<&str> {
        self.payload_schemas.keys().map(String::as_str).collect()
    }

    /// Validate a raw body into a [`Request`].
    pub fn validate(&self, raw: &str) -> Result<Request, GatewayError> {
        if raw.len() > self.max_body_bytes {
            return Err(GatewayError::Schema {
                field: "body".to_string(),
                reason: format!(
                    "body of {} bytes exceeds the {} byte limit",
                    raw.len(),
                    self.max_body_bytes
                ),
            });
        }

        let value: Value = serde_json::from_str(raw).map_err(|e| GatewayError::Schema {
            field: "body".to_string(),
            reason: format!("invalid JSON: {}", e),
        })?;

        if let Err(errors) = self.envelope.validate(&value) {
            if let Some(error) = errors.into_iter().next() {
                let path = error.instance_path.to_string();
                return Err(GatewayError::Schema {
                    field: if path.is_empty() { "body".to_string() } else { path },
                    reason: error.to_string(),
                });
            }
        }

        let schema_id = value
            .get("payload_schema")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let payload_schema =
            self.payload_schemas
                .get(schema_id)
                .ok_or_else(|| GatewayError::Schema {
                    field: "payload_schema".to_string(),
                    reason: format!("`{}` is not a registered schema", schema_id),
                })?;

        if let Some(payload) = value.get("payload") {
            if let Err(errors) = payload_schema.validate(payload) {
                if let Some(error) = errors.into_iter().next() {
                    return Err(GatewayError::Schema {
                        field: format!("/payload{}", error.instance_path),
                        reason: error.to_string(),
                    });
                }
            }
        }

        let request: Request =
            serde_json::from_value(value).map_err(|e| GatewayError::Schema {
                field: "body".to_string(),
                reason: format!("deserialization failed: {}", e),
            })?;

        let skew = (Utc::now() - request.timestamp).num_seconds().abs();
        if skew > self.clock_skew_secs {
            debug!(request_id = %request.request_id, skew, "rejecting stale request");
            return Err(GatewayError::ClockSkew {
                skew_secs: skew,
                allowed_secs: self.clock_skew_secs,
            });
        }

        Ok(request)
    }
}

fn compile(schema: &str) -> Option<JSONSchema> {
    let value: Value = serde_json::from_str(schema).ok()?;
    JSONSchema::compile(&value).ok()
}
