//! Request orchestration.
//!
//! The gateway drives each request through validate → authenticate →
//! authorize → screen → route → execute (with cascade) → respond, emitting
//! exactly one [`AiEvent`] per request and at least one audit record on every
//! path. All collaborators are injected at construction; the gateway itself
//! holds no per-request state between calls.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditLog, AuditRecord};
use crate::auth::{Authorizer, Permission, TokenService};
use crate::backends::{ProcessFailure, ProcessParams};
use crate::config::GatewayConfig;
use crate::detection::pii::PiiConfigError;
use crate::detection::redaction::RedactionStrategy;
use crate::detection::{InjectionDetector, PiiDetector, PiiResult, PiiTokenizer, Redactor};
use crate::error::GatewayError;
use crate::hash;
use crate::pipeline::event::AiEvent;
use crate::pipeline::EventPipeline;
use crate::registry::{BackendRegistry, Capability};
use crate::request::{
    ProcessResult, ProcessingHint, ProcessingMeta, Request, Response, ResponseStatus,
    SecurityFlags, TokenUsage,
};
use crate::router::{self, RouteQuery};
use crate::validate::RequestValidator;
use crate::auth::authz::ResourceContext;

/// Principal hash recorded before authentication succeeds
const UNAUTHENTICATED: &str = "-";

struct CachedResponse {
    response: Response,
    stored_at: Instant,
}

/// The request-path orchestrator.
pub struct Gateway {
    config: GatewayConfig,
    validator: RequestValidator,
    tokens: TokenService,
    authorizer: Authorizer,
    pii: PiiDetector,
    injection: InjectionDetector,
    tokenizer: Arc<PiiTokenizer>,
    registry: Arc<BackendRegistry>,
    audit: Arc<AuditLog>,
    pipeline: EventPipeline,
    idempotency: DashMap<(String, String), CachedResponse>,
}

impl Gateway {
    /// Wire a gateway from its collaborators.
    pub fn new(
        config: GatewayConfig,
        tokens: TokenService,
        registry: Arc<BackendRegistry>,
        audit: Arc<AuditLog>,
        pipeline: EventPipeline,
    ) -> Result<Self, PiiConfigError> {
        let pii = PiiDetector::with_patterns(&config.pii_patterns, &config.custom_pii_types)?;
        let authorizer = Authorizer::new(
            config.default_cost_ceiling_usd,
            config.cost_ceilings.clone(),
        );
        Ok(Self {
            validator: RequestValidator::new(&config),
            tokens,
            authorizer,
            pii,
            injection: InjectionDetector::new(),
            tokenizer: Arc::new(PiiTokenizer::new()),
            registry,
            audit,
            pipeline,
            idempotency: DashMap::new(),
            config,
        })
    }

    /// Handle one raw request body. Never fails: every error becomes an
    /// error response, and every path emits its event and audit records.
    pub async fn handle(&self, raw: &str) -> Response {
        let started = Instant::now();
        match self.validator.validate(raw) {
            Ok(request) => self.process(request, started).await,
            Err(err) => {
                let request_id =
                    extract_request_id(raw).unwrap_or_else(|| "unknown".to_string());
                warn!(%request_id, error = %err, "request rejected before authentication");
                self.audit.record(
                    &AuditRecord::new(
                        AuditEventType::Processing,
                        &request_id,
                        UNAUTHENTICATED,
                        "rejected",
                    )
                    .with_attr("code", err.code().as_str()),
                );
                self.fail(
                    &request_id,
                    UNAUTHENTICATED,
                    EventDraft::pre_routing("-"),
                    err,
                    SecurityFlags::default(),
                    started,
                )
                .await
            }
        }
    }

    async fn process(&self, request: Request, started: Instant) -> Response {
        let request_id = request.request_id.clone();
        let deadline = Duration::from_millis(request.config.timeout_ms);

        // Authentication. Failures record an authz audit entry and surface a
        // deliberately detail-free code.
        let principal = match self.tokens.authenticate(&request.auth.token) {
            Ok(p) => p,
            Err(err) => {
                self.audit.record(
                    &AuditRecord::new(
                        AuditEventType::Authz,
                        &request_id,
                        UNAUTHENTICATED,
                        "denied",
                    )
                    .with_attr("code", err.code().as_str()),
                );
                return self
                    .fail(
                        &request_id,
                        UNAUTHENTICATED,
                        EventDraft::pre_routing("-"),
                        err,
                        SecurityFlags::default(),
                        started,
                    )
                    .await;
            }
        };
        let principal_hash = hash::principal_hash(&principal.subject);

        // Typed payload view; shape was already schema-checked
        let payload = match request.llm_payload() {
            Ok(p) => p,
            Err(e) => {
                let err = GatewayError::Schema {
                    field: "payload".to_string(),
                    reason: e.to_string(),
                };
                self.audit.record(
                    &AuditRecord::new(
                        AuditEventType::Processing,
                        &request_id,
                        &principal_hash,
                        "rejected",
                    )
                    .with_attr("code", err.code().as_str()),
                );
                return self
                    .fail(
                        &request_id,
                        &principal_hash,
                        EventDraft::pre_routing("-"),
                        err,
                        SecurityFlags::default(),
                        started,
                    )
                    .await;
            }
        };

        let estimated_tokens = payload.estimate_tokens();
        let snapshot = self.registry.snapshot();
        let draft = EventDraft::pre_routing(&payload.model)
            .with_prompt(&payload.prompt);

        // Authorization uses the worst-case rate across the registry so a
        // principal cannot route around its ceiling via hint choice.
        let worst_rate = snapshot
            .iter()
            .map(|b| b.descriptor.cost_per_1k_tokens)
            .fold(0.0, f64::max);
        let estimated_cost = (estimated_tokens as f64 / 1000.0) * worst_rate;

        if let Err(reason) = self.authorizer.authorize(
            &principal,
            Permission::Execute,
            &ResourceContext {
                sensitivity: request.config.sensitivity,
                estimated_cost_usd: estimated_cost,
            },
        ) {
            self.audit.record(
                &AuditRecord::new(
                    AuditEventType::Authz,
                    &request_id,
                    &principal_hash,
                    "denied",
                )
                .with_attr("reason", reason.clone())
                .with_attr("sensitivity", request.config.sensitivity.as_str()),
            );
            return self
                .fail(
                    &request_id,
                    &principal_hash,
                    draft,
                    GatewayError::AuthzDenied { reason },
                    SecurityFlags::default(),
                    started,
                )
                .await;
        }

        // Idempotent replay: a prior terminal response within TTL is returned
        // unmodified, with its own event marked as a replay.
        if let Some(key) = &request.idempotency_key {
            let cache_key = (principal.subject.clone(), key.clone());
            let cached = self.idempotency.get(&cache_key).and_then(|entry| {
                (entry.stored_at.elapsed() <= self.config.idempotency_ttl)
                    .then(|| entry.response.clone())
            });
            match cached {
                Some(response) => {
                    debug!(%request_id, "serving idempotent replay");
                    self.audit.record(&AuditRecord::new(
                        AuditEventType::Processing,
                        &request_id,
                        &principal_hash,
                        "idempotent_replay",
                    ));
                    let mut replay = draft;
                    replay.metadata.insert(
                        "idempotent_replay".into(),
                        serde_json::Value::Bool(true),
                    );
                    replay.success = response.status == ResponseStatus::Ok;
                    replay.error_code =
                        response.error.as_ref().map(|e| e.code.as_str().to_string());
                    self.emit(&request_id, &principal_hash, replay, started).await;
                    return response;
                }
                None => {
                    self.idempotency.remove_if(&cache_key, |_, entry| {
                        entry.stored_at.elapsed() > self.config.idempotency_ttl
                    });
                }
            }
        }

        // Security screening
        let pii_result = if request.config.enable_pii_detection {
            self.pii.scan(&payload.prompt)
        } else {
            PiiResult::default()
        };
        let injection = if request.config.enable_injection_detection {
            self.injection.detect(&payload.prompt)
        } else {
            None
        };
        let flags = SecurityFlags {
            has_pii: pii_result.has_pii,
            injection_detected: injection.is_some(),
        };

        let mut draft = draft;
        draft.has_pii = pii_result.has_pii;
        draft.pii_types = pii_result.type_labels();
        draft.injection_detected = injection.is_some();
        if let Some(finding) = injection {
            info!(%request_id, family = finding.family.label(), "prompt injection detected");
            draft.metadata.insert(
                "injection_family".into(),
                serde_json::Value::String(finding.family.label().into()),
            );
        }
        if pii_result.has_pii {
            self.audit.record(
                &AuditRecord::new(AuditEventType::Pii, &request_id, &principal_hash, "detected")
                    .with_attr("types", serde_json::json!(pii_result.type_labels())),
            );
        }

        // Routing
        let prior_failures: HashSet<String> = HashSet::new();
        let query = RouteQuery {
            capability: capability_for_schema(&request.payload_schema),
            sensitivity: request.config.sensitivity,
            hint: request.config.processing_hint,
            max_cost_usd: Some(self.authorizer.cost_ceiling(&principal)),
            max_latency_ms: Some(request.config.timeout_ms),
            estimated_tokens,
            has_pii: pii_result.has_pii,
            prior_failures: &prior_failures,
        };
        let decision = router::route(
            &snapshot,
            &query,
            &self.config.router_weights,
            self.config.use_cascade,
            self.config.max_fallbacks,
        );

        if decision.candidates.is_empty() {
            // Distinguish "nothing can do this" from "PII compatibility
            // removed everything that could"
            if decision.pii_excluded > 0 {
                let pii_types = pii_result.type_labels();
                self.audit.record(
                    &AuditRecord::new(
                        AuditEventType::Violation,
                        &request_id,
                        &principal_hash,
                        "pii_routing_blocked",
                    )
                    .with_attr("types", serde_json::json!(pii_types))
                    .with_attr("hint", request.config.processing_hint.as_str()),
                );
                return self
                    .fail(
                        &request_id,
                        &principal_hash,
                        draft,
                        GatewayError::PiiRoutingBlocked { pii_types },
                        flags,
                        started,
                    )
                    .await;
            }
            self.audit.record(&AuditRecord::new(
                AuditEventType::Processing,
                &request_id,
                &principal_hash,
                "no_backend",
            ));
            return self
                .fail(
                    &request_id,
                    &principal_hash,
                    draft,
                    GatewayError::NoBackendAvailable,
                    flags,
                    started,
                )
                .await;
        }
        if decision.hint_ignored {
            draft
                .metadata
                .insert("hint_ignored".into(), serde_json::Value::Bool(true));
        }

        // Redact the outbound prompt when configured and needed
        let outbound_prompt = match self.config.redaction {
            Some(strategy) if pii_result.has_pii => {
                Redactor::new(strategy, &self.tokenizer).apply(&payload.prompt, &pii_result.matches)
            }
            _ => payload.prompt.clone(),
        };
        let params = ProcessParams {
            model: payload.model.clone(),
            max_tokens: payload.max_tokens,
            temperature: payload.temperature,
        };

        let response = self
            .execute_cascade(
                &request, &decision.candidates, &snapshot, &outbound_prompt, &params,
                &request_id, &principal_hash, draft, flags, started, deadline,
            )
            .await;

        // Cache terminal responses for idempotent retry. Retriable error
        // codes stay uncached so a retry actually retries.
        if let Some(key) = &request.idempotency_key {
            let cacheable = match &response.error {
                None => true,
                Some(body) => !body.code.retriable(),
            };
            if cacheable {
                self.idempotency.insert(
                    (principal.subject.clone(), key.clone()),
                    CachedResponse {
                        response: response.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
        }

        response
    }

    /// Try each routed candidate in order within the request deadline.
    #[allow(clippy::too_many_arguments)]
    async fn execute_cascade(
        &self,
        request: &Request,
        candidates: &[String],
        snapshot: &crate::registry::RegistrySnapshot,
        outbound_prompt: &str,
        params: &ProcessParams,
        request_id: &str,
        principal_hash: &str,
        mut draft: EventDraft,
        flags: SecurityFlags,
        started: Instant,
        deadline: Duration,
    ) -> Response {
        let mut last_failure: Option<(String, ProcessFailure)> = None;
        let mut attempts = 0usize;

        for (idx, backend_id) in candidates.iter().enumerate() {
            let remaining = deadline.saturating_sub(started.elapsed());
            if (remaining.as_millis() as u64) < self.config.min_slice_ms {
                debug!(%request_id, "cascade halted: remaining budget below minimum slice");
                break;
            }
            let Some(entry) = snapshot.get(backend_id) else {
                continue;
            };

            attempts += 1;
            let attempt_started = Instant::now();
            let result = match tokio::time::timeout(
                remaining,
                entry.adapter.process(outbound_prompt, params, remaining),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProcessFailure::Timeout),
            };

            match result {
                Ok(output) => {
                    let below_threshold =
                        output.confidence < entry.descriptor.confidence_threshold;
                    let more_candidates = idx + 1 < candidates.len();

                    if below_threshold
                        && request.config.processing_hint == ProcessingHint::Hybrid
                        && more_candidates
                    {
                        // Soft failure: capable-enough fallback exists
                        self.audit.record(
                            &AuditRecord::new(
                                AuditEventType::Processing,
                                request_id,
                                principal_hash,
                                "low_confidence_cascade",
                            )
                            .with_attr("backend", backend_id.as_str())
                            .with_attr("confidence", output.confidence),
                        );
                        continue;
                    }

                    if below_threshold {
                        draft.metadata.insert(
                            "low_confidence".into(),
                            serde_json::Value::Bool(true),
                        );
                    }

                    self.audit.record(
                        &AuditRecord::new(
                            AuditEventType::Processing,
                            request_id,
                            principal_hash,
                            "ok",
                        )
                        .with_attr("backend", backend_id.as_str())
                        .with_attr("latency_ms", attempt_started.elapsed().as_millis() as u64)
                        .with_attr("fallback", idx > 0),
                    );

                    // Restore tokenized PII before the response leaves
                    let response_text = match self.config.redaction {
                        Some(RedactionStrategy::Tokenize) if draft.has_pii => {
                            self.tokenizer.detokenize(&output.response)
                        }
                        _ => output.response.clone(),
                    };

                    draft.backend = Some(backend_id.clone());
                    draft.provider = backend_id.clone();
                    draft.tokens = output.tokens;
                    draft.cost_usd = output.cost_usd;
                    draft.success = true;
                    draft.response_fingerprint = hash::fingerprint(&response_text);
                    draft
                        .metadata
                        .insert("attempts".into(), serde_json::json!(attempts));
                    self.emit(request_id, principal_hash, draft, started).await;

                    return Response::ok(
                        request_id,
                        ProcessResult {
                            response: response_text,
                            tokens: output.tokens,
                        },
                        ProcessingMeta {
                            backend: Some(backend_id.clone()),
                            latency_ms: started.elapsed().as_millis() as u64,
                            cost_usd: output.cost_usd,
                            confidence: output.confidence,
                            fallback_used: idx > 0,
                        },
                        flags,
                    );
                }
                Err(failure) => {
                    warn!(%request_id, backend = %backend_id, error = %failure, "backend attempt failed");
                    self.audit.record(
                        &AuditRecord::new(
                            AuditEventType::Processing,
                            request_id,
                            principal_hash,
                            "failed",
                        )
                        .with_attr("backend", backend_id.as_str())
                        .with_attr("code", failure.code().as_str())
                        .with_attr("retriable", failure.retriable()),
                    );
                    let retriable = failure.retriable();
                    last_failure = Some((backend_id.clone(), failure));
                    if !retriable {
                        break;
                    }
                }
            }
        }

        // Exhausted candidates or budget
        draft
            .metadata
            .insert("attempts".into(), serde_json::json!(attempts));
        let err = match last_failure {
            Some((backend_id, ProcessFailure::Timeout)) => {
                draft.backend = Some(backend_id.clone());
                draft.provider = backend_id.clone();
                GatewayError::BackendTimeout { backend_id }
            }
            Some((backend_id, ProcessFailure::RateLimited)) => {
                draft.backend = Some(backend_id.clone());
                draft.provider = backend_id.clone();
                GatewayError::RateLimited { backend_id }
            }
            Some((backend_id, failure)) => {
                draft.backend = Some(backend_id.clone());
                draft.provider = backend_id.clone();
                GatewayError::Backend {
                    backend_id,
                    message: failure.to_string(),
                }
            }
            // Budget ran out before any attempt could start
            None => GatewayError::BackendTimeout {
                backend_id: candidates.first().cloned().unwrap_or_default(),
            },
        };
        self.fail(request_id, principal_hash, draft, err, flags, started)
            .await
    }

    /// Build the error response and emit the request's event.
    async fn fail(
        &self,
        request_id: &str,
        principal_hash: &str,
        mut draft: EventDraft,
        err: GatewayError,
        flags: SecurityFlags,
        started: Instant,
    ) -> Response {
        let code = err.code();
        draft.success = false;
        draft.error_code = Some(code.as_str().to_string());
        let backend = draft.backend.clone();
        self.emit(request_id, principal_hash, draft, started).await;

        Response::error(
            request_id,
            code,
            err.to_string(),
            ProcessingMeta {
                backend,
                latency_ms: started.elapsed().as_millis() as u64,
                cost_usd: 0.0,
                confidence: 0.0,
                fallback_used: false,
            },
            flags,
        )
    }

    /// Hand the event to the pipeline. Exactly one call per request path.
    async fn emit(
        &self,
        request_id: &str,
        principal_hash: &str,
        draft: EventDraft,
        started: Instant,
    ) {
        let event = draft.into_event(request_id, principal_hash, started);
        self.pipeline.emit(event).await;
    }

    /// Snapshot of the tokenizer for detokenization by trusted egress paths.
    pub fn tokenizer(&self) -> Arc<PiiTokenizer> {
        self.tokenizer.clone()
    }
}

/// Capability implied by a payload schema id.
///
/// Only LLM text schemas are registered today; new schema families map to
/// their capability here as they are added.
fn capability_for_schema(_schema_id: &str) -> Capability {
    Capability::TextGeneration
}

/// Best-effort id extraction from an invalid body, for audit correlation
fn extract_request_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("request_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

/// Accumulates event fields as a request progresses.
struct EventDraft {
    provider: String,
    model: String,
    backend: Option<String>,
    prompt_fingerprint: String,
    response_fingerprint: String,
    tokens: TokenUsage,
    cost_usd: f64,
    success: bool,
    error_code: Option<String>,
    has_pii: bool,
    pii_types: Vec<String>,
    injection_detected: bool,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl EventDraft {
    /// Draft for a request that has not reached a backend yet
    fn pre_routing(model: &str) -> Self {
        Self {
            provider: "gateway".to_string(),
            model: model.to_string(),
            backend: None,
            prompt_fingerprint: String::new(),
            response_fingerprint: String::new(),
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            success: false,
            error_code: None,
            has_pii: false,
            pii_types: Vec::new(),
            injection_detected: false,
            metadata: BTreeMap::new(),
        }
    }

    fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt_fingerprint = hash::fingerprint(prompt);
        self
    }

    fn into_event(self, request_id: &str, principal_hash: &str, started: Instant) -> AiEvent {
        AiEvent {
            request_id: request_id.to_string(),
            timestamp: chrono::Utc::now(),
            principal_hash: principal_hash.to_string(),
            provider: self.provider,
            model: self.model,
            prompt_fingerprint: self.prompt_fingerprint,
            response_fingerprint: self.response_fingerprint,
            latency_ms: started.elapsed().as_millis() as u64,
            tokens: self.tokens,
            cost_usd: self.cost_usd,
            success: self.success,
            error_code: self.error_code,
            has_pii: self.has_pii,
            pii_types: self.pii_types,
            injection_detected: self.injection_detected,
            risk_level: Default::default(),
            metadata: self.metadata,
        }
    }
}
