//! In-memory reference adapters.
//!
//! `StaticLlmAdapter` and `RuleEngineAdapter` stand in for real model
//! backends in local runs; `ScriptedAdapter` replays a fixed sequence of
//! outcomes for cascade and failure-path tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backends::{
    estimate_tokens, BackendAdapter, HealthStatus, ProcessFailure, ProcessOutput, ProcessParams,
};
use crate::registry::Backend;
use crate::request::TokenUsage;

/// Deterministic stand-in for an LLM backend.
///
/// Produces a canned completion sized to the request, priced at the
/// descriptor's rate, with a fixed confidence.
pub struct StaticLlmAdapter {
    descriptor: Backend,
    confidence: f64,
    simulated_latency: Duration,
}

impl StaticLlmAdapter {
    pub fn new(descriptor: Backend) -> Self {
        Self {
            descriptor,
            confidence: 0.9,
            simulated_latency: Duration::from_millis(0),
        }
    }

    /// Override the confidence reported with every response
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Add artificial processing delay (for deadline tests and demos)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = latency;
        self
    }
}

#[async_trait]
impl BackendAdapter for StaticLlmAdapter {
    fn describe(&self) -> Backend {
        self.descriptor.clone()
    }

    async fn process(
        &self,
        prompt: &str,
        params: &ProcessParams,
        deadline: Duration,
    ) -> Result<ProcessOutput, ProcessFailure> {
        if self.simulated_latency > deadline {
            tokio::time::sleep(deadline).await;
            return Err(ProcessFailure::Timeout);
        }
        if !self.simulated_latency.is_zero() {
            tokio::time::sleep(self.simulated_latency).await;
        }

        let prompt_tokens = estimate_tokens(prompt);
        let budget = params
            .max_tokens
            .unwrap_or(128)
            .min(self.descriptor.max_tokens);
        let response = format!(
            "[{}] completion for {} prompt tokens",
            self.descriptor.id, prompt_tokens
        );
        let completion_tokens = estimate_tokens(&response).min(budget);
        let tokens = TokenUsage::new(prompt_tokens, completion_tokens);

        Ok(ProcessOutput {
            response,
            cost_usd: self.descriptor.estimate_cost(tokens.total),
            confidence: self.confidence,
            latency_ms: self.simulated_latency.as_millis() as u64,
            tokens,
        })
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Ok
    }
}

/// Keyword-rule backend: free, fast, and only confident when a rule matches.
pub struct RuleEngineAdapter {
    descriptor: Backend,
    rules: Vec<(String, String)>,
}

impl RuleEngineAdapter {
    pub fn new(descriptor: Backend, rules: Vec<(String, String)>) -> Self {
        Self { descriptor, rules }
    }
}

#[async_trait]
impl BackendAdapter for RuleEngineAdapter {
    fn describe(&self) -> Backend {
        self.descriptor.clone()
    }

    async fn process(
        &self,
        prompt: &str,
        _params: &ProcessParams,
        _deadline: Duration,
    ) -> Result<ProcessOutput, ProcessFailure> {
        let lower = prompt.to_lowercase();
        let matched = self
            .rules
            .iter()
            .find(|(keyword, _)| lower.contains(&keyword.to_lowercase()));

        let (response, confidence) = match matched {
            Some((_, answer)) => (answer.clone(), 0.95),
            // No rule fired: answer generically with low confidence so a
            // hybrid cascade escalates to a model backend
            None => ("No matching rule for this request.".to_string(), 0.2),
        };

        let tokens = TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&response));
        Ok(ProcessOutput {
            response,
            cost_usd: 0.0,
            confidence,
            latency_ms: 1,
            tokens,
        })
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Ok
    }
}

/// Replays a scripted sequence of outcomes, one per invocation.
///
/// Used by tests to exercise cascade and failure paths deterministically.
pub struct ScriptedAdapter {
    descriptor: Backend,
    script: Mutex<VecDeque<Result<ProcessOutput, ProcessFailure>>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(descriptor: Backend) -> Self {
        Self {
            descriptor,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a successful outcome
    pub fn push_ok(&self, response: &str, confidence: f64, cost_usd: f64) {
        let tokens = TokenUsage::new(10, estimate_tokens(response));
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(Ok(ProcessOutput {
                response: response.to_string(),
                tokens,
                cost_usd,
                confidence,
                latency_ms: 5,
            }));
    }

    /// Queue a failure outcome
    pub fn push_failure(&self, failure: ProcessFailure) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(Err(failure));
    }

    /// How many times `process` was invoked
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn describe(&self) -> Backend {
        self.descriptor.clone()
    }

    async fn process(
        &self,
        _prompt: &str,
        _params: &ProcessParams,
        _deadline: Duration,
    ) -> Result<ProcessOutput, ProcessFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProcessFailure::InvalidResponse {
                    message: "script exhausted".to_string(),
                })
            })
    }

    async fn health(&self) -> HealthStatus {
        if self.script.lock().expect("script lock poisoned").is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        }
    }
}
