//! Anomaly detection over the event stream.
//!
//! Two evaluation modes: event-local rules run synchronously against each new
//! event plus a recent-history slice; pattern-level rules run over sliding
//! windows when the pipeline flushes or on demand. History windows for spike
//! detection are per-model; request/cost-rate windows are global.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::pipeline::event::AiEvent;

/// Severity of a detected anomaly, ordered medium < critical
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Medium => "medium",
            AnomalySeverity::High => "high",
            AnomalySeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "medium" => Some(AnomalySeverity::Medium),
            "high" => Some(AnomalySeverity::High),
            "critical" => Some(AnomalySeverity::Critical),
            _ => None,
        }
    }
}

/// Classified anomaly kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    HighCost,
    HighLatency,
    HighTokens,
    PiiDetected,
    PromptInjection,
    RequestFailure,
    CostSpike,
    LatencySpike,
    HighErrorRate,
    HighRequestRate,
    HighCostRate,
    ModelErrors,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::HighCost => "high_cost",
            AnomalyType::HighLatency => "high_latency",
            AnomalyType::HighTokens => "high_tokens",
            AnomalyType::PiiDetected => "pii_detected",
            AnomalyType::PromptInjection => "prompt_injection",
            AnomalyType::RequestFailure => "request_failure",
            AnomalyType::CostSpike => "cost_spike",
            AnomalyType::LatencySpike => "latency_spike",
            AnomalyType::HighErrorRate => "high_error_rate",
            AnomalyType::HighRequestRate => "high_request_rate",
            AnomalyType::HighCostRate => "high_cost_rate",
            AnomalyType::ModelErrors => "model_errors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high_cost" => Some(AnomalyType::HighCost),
            "high_latency" => Some(AnomalyType::HighLatency),
            "high_tokens" => Some(AnomalyType::HighTokens),
            "pii_detected" => Some(AnomalyType::PiiDetected),
            "prompt_injection" => Some(AnomalyType::PromptInjection),
            "request_failure" => Some(AnomalyType::RequestFailure),
            "cost_spike" => Some(AnomalyType::CostSpike),
            "latency_spike" => Some(AnomalyType::LatencySpike),
            "high_error_rate" => Some(AnomalyType::HighErrorRate),
            "high_request_rate" => Some(AnomalyType::HighRequestRate),
            "high_cost_rate" => Some(AnomalyType::HighCostRate),
            "model_errors" => Some(AnomalyType::ModelErrors),
            _ => None,
        }
    }

    pub fn severity(&self) -> AnomalySeverity {
        match self {
            AnomalyType::PromptInjection | AnomalyType::HighErrorRate => AnomalySeverity::Critical,
            AnomalyType::HighCost
            | AnomalyType::PiiDetected
            | AnomalyType::RequestFailure
            | AnomalyType::CostSpike
            | AnomalyType::HighCostRate
            | AnomalyType::ModelErrors => AnomalySeverity::High,
            AnomalyType::HighLatency
            | AnomalyType::HighTokens
            | AnomalyType::LatencySpike
            | AnomalyType::HighRequestRate => AnomalySeverity::Medium,
        }
    }

    pub fn recommended_action(&self) -> &'static str {
        match self {
            AnomalyType::HighCost => "Review the request's token budget and model choice",
            AnomalyType::HighLatency => "Check backend health and consider a faster tier",
            AnomalyType::HighTokens => "Cap max_tokens for this application",
            AnomalyType::PiiDetected => "Verify PII routing policy and redaction strategy",
            AnomalyType::PromptInjection => {
                "Inspect the application; consider blocking the source"
            }
            AnomalyType::RequestFailure => "Check backend availability and error budgets",
            AnomalyType::CostSpike => "Compare against recent spend for this model",
            AnomalyType::LatencySpike => "Compare against recent latency for this model",
            AnomalyType::HighErrorRate => "Page on-call; the gateway is degraded",
            AnomalyType::HighRequestRate => "Review traffic source; possible runaway client",
            AnomalyType::HighCostRate => "Review hourly spend; consider lowering ceilings",
            AnomalyType::ModelErrors => "Degrade or disable the failing model",
        }
    }
}

/// A detected anomaly, persisted alongside its triggering event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_id: String,
    /// Triggering event's request id; absent for window-level detections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub description: String,
    pub details: serde_json::Value,
    pub recommended_action: String,
}

impl Anomaly {
    fn new(
        anomaly_type: AnomalyType,
        event_id: Option<&str>,
        description: String,
        details: serde_json::Value,
    ) -> Self {
        Self {
            anomaly_id: Uuid::new_v4().to_string(),
            event_id: event_id.map(str::to_string),
            timestamp: Utc::now(),
            anomaly_type,
            severity: anomaly_type.severity(),
            description,
            details,
            recommended_action: anomaly_type.recommended_action().to_string(),
        }
    }
}

/// Detection thresholds, all configurable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AnomalyThresholds {
    /// Per-event cost threshold (USD)
    pub cost_usd: f64,
    /// Per-event latency threshold (ms)
    pub latency_ms: u64,
    /// Per-event total-token threshold
    pub tokens: u32,
    /// Spike multiplier over the recent per-model mean
    pub spike_factor: f64,
    /// History window for spike baselines (minutes)
    pub spike_window_mins: i64,
    /// Minimum samples before spike detection applies
    pub spike_min_samples: usize,
    /// Global error-rate threshold
    pub error_rate: f64,
    /// Minimum events before the error-rate rule applies
    pub error_rate_min_events: usize,
    /// Error-rate window (minutes)
    pub error_rate_window_mins: i64,
    /// Global request-rate threshold (requests per minute)
    pub request_rate_per_min: f64,
    /// Global cost-rate threshold (USD per hour)
    pub cost_rate_per_hour: f64,
    /// Per-model error-rate threshold
    pub model_error_rate: f64,
    /// Minimum per-model samples before the model-errors rule applies
    pub model_error_min_samples: usize,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            cost_usd: 0.50,
            latency_ms: 5_000,
            tokens: 8_000,
            spike_factor: 3.0,
            spike_window_mins: 10,
            spike_min_samples: 5,
            error_rate: 0.10,
            error_rate_min_events: 10,
            error_rate_window_mins: 5,
            request_rate_per_min: 50.0,
            cost_rate_per_hour: 10.0,
            model_error_rate: 0.2,
            model_error_min_samples: 5,
        }
    }
}

/// Rule-based anomaly detector. Pure: all inputs arrive as arguments.
pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyThresholds::default())
    }
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self { thresholds }
    }

    /// Event-local rules, evaluated against the new event plus recent history.
    pub fn evaluate_event(&self, event: &AiEvent, history: &[AiEvent]) -> Vec<Anomaly> {
        let t = &self.thresholds;
        let id = event.request_id.as_str();
        let mut anomalies = Vec::new();

        if event.cost_usd > t.cost_usd {
            anomalies.push(Anomaly::new(
                AnomalyType::HighCost,
                Some(id),
                format!("request cost ${:.4} exceeds ${:.2}", event.cost_usd, t.cost_usd),
                json!({ "cost_usd": event.cost_usd, "threshold": t.cost_usd }),
            ));
        }
        if event.latency_ms > t.latency_ms {
            anomalies.push(Anomaly::new(
                AnomalyType::HighLatency,
                Some(id),
                format!("latency {}ms exceeds {}ms", event.latency_ms, t.latency_ms),
                json!({ "latency_ms": event.latency_ms, "threshold": t.latency_ms }),
            ));
        }
        if event.tokens.total > t.tokens {
            anomalies.push(Anomaly::new(
                AnomalyType::HighTokens,
                Some(id),
                format!("token usage {} exceeds {}", event.tokens.total, t.tokens),
                json!({ "total_tokens": event.tokens.total, "threshold": t.tokens }),
            ));
        }
        if event.has_pii {
            anomalies.push(Anomaly::new(
                AnomalyType::PiiDetected,
                Some(id),
                format!("PII detected: {}", event.pii_types.join(", ")),
                json!({ "pii_types": event.pii_types }),
            ));
        }
        if event.injection_detected {
            anomalies.push(Anomaly::new(
                AnomalyType::PromptInjection,
                Some(id),
                "prompt injection pattern detected".to_string(),
                json!({ "risk_level": event.risk_level.as_str() }),
            ));
        }
        if !event.success {
            anomalies.push(Anomaly::new(
                AnomalyType::RequestFailure,
                Some(id),
                format!(
                    "request failed with {}",
                    event.error_code.as_deref().unwrap_or("unknown")
                ),
                json!({ "error_code": event.error_code }),
            ));
        }

        // Spike rules: same model, recent window, enough samples
        let window_start = event.timestamp - Duration::minutes(t.spike_window_mins);
        let baseline: Vec<&AiEvent> = history
            .iter()
            .filter(|e| e.model == event.model && e.timestamp >= window_start)
            .collect();

        if baseline.len() >= t.spike_min_samples {
            let mean_cost =
                baseline.iter().map(|e| e.cost_usd).sum::<f64>() / baseline.len() as f64;
            if mean_cost > 0.0 && event.cost_usd > t.spike_factor * mean_cost {
                anomalies.push(Anomaly::new(
                    AnomalyType::CostSpike,
                    Some(id),
                    format!(
                        "cost ${:.4} is {:.1}x the recent mean ${:.4} for model {}",
                        event.cost_usd,
                        event.cost_usd / mean_cost,
                        mean_cost,
                        event.model
                    ),
                    json!({
                        "cost_usd": event.cost_usd,
                        "mean_cost_usd": mean_cost,
                        "samples": baseline.len(),
                        "model": event.model,
                    }),
                ));
            }

            let mean_latency =
                baseline.iter().map(|e| e.latency_ms as f64).sum::<f64>() / baseline.len() as f64;
            if mean_latency > 0.0 && event.latency_ms as f64 > t.spike_factor * mean_latency {
                anomalies.push(Anomaly::new(
                    AnomalyType::LatencySpike,
                    Some(id),
                    format!(
                        "latency {}ms is {:.1}x the recent mean {:.0}ms for model {}",
                        event.latency_ms,
                        event.latency_ms as f64 / mean_latency,
                        mean_latency,
                        event.model
                    ),
                    json!({
                        "latency_ms": event.latency_ms,
                        "mean_latency_ms": mean_latency,
                        "samples": baseline.len(),
                        "model": event.model,
                    }),
                ));
            }
        }

        anomalies
    }

    /// Pattern-level rules over a sliding window ending at `now`.
    pub fn evaluate_patterns(&self, window: &[AiEvent], now: DateTime<Utc>) -> Vec<Anomaly> {
        let t = &self.thresholds;
        let mut anomalies = Vec::new();

        // Global error rate over the configured window
        let err_start = now - Duration::minutes(t.error_rate_window_mins);
        let recent: Vec<&AiEvent> = window.iter().filter(|e| e.timestamp >= err_start).collect();
        if recent.len() >= t.error_rate_min_events {
            let errors = recent.iter().filter(|e| !e.success).count();
            let rate = errors as f64 / recent.len() as f64;
            if rate > t.error_rate {
                anomalies.push(Anomaly::new(
                    AnomalyType::HighErrorRate,
                    None,
                    format!(
                        "error rate {:.0}% over {} events in the last {} min",
                        rate * 100.0,
                        recent.len(),
                        t.error_rate_window_mins
                    ),
                    json!({ "error_rate": rate, "events": recent.len() }),
                ));
            }
        }

        // Global request rate over the most recent minute
        let minute_ago = now - Duration::minutes(1);
        let last_minute = window.iter().filter(|e| e.timestamp >= minute_ago).count();
        if last_minute as f64 > t.request_rate_per_min {
            anomalies.push(Anomaly::new(
                AnomalyType::HighRequestRate,
                None,
                format!("{} requests in the last minute", last_minute),
                json!({ "requests_per_min": last_minute }),
            ));
        }

        // Global cost rate over the last hour
        let hour_ago = now - Duration::hours(1);
        let hourly_cost: f64 = window
            .iter()
            .filter(|e| e.timestamp >= hour_ago)
            .map(|e| e.cost_usd)
            .sum();
        if hourly_cost > t.cost_rate_per_hour {
            anomalies.push(Anomaly::new(
                AnomalyType::HighCostRate,
                None,
                format!("${:.2} spent in the last hour", hourly_cost),
                json!({ "cost_usd_per_hour": hourly_cost }),
            ));
        }

        // Per-model error rates over the error-rate window
        let mut models: Vec<&str> = recent.iter().map(|e| e.model.as_str()).collect();
        models.sort_unstable();
        models.dedup();
        for model in models {
            let samples: Vec<&&AiEvent> =
                recent.iter().filter(|e| e.model == model).collect();
            if samples.len() < t.model_error_min_samples {
                continue;
            }
            let errors = samples.iter().filter(|e| !e.success).count();
            let rate = errors as f64 / samples.len() as f64;
            if rate > t.model_error_rate {
                anomalies.push(Anomaly::new(
                    AnomalyType::ModelErrors,
                    None,
                    format!(
                        "model {} error rate {:.0}% over {} samples",
                        model,
                        rate * 100.0,
                        samples.len()
                    ),
                    json!({ "model": model, "error_rate": rate, "samples": samples.len() }),
                ));
            }
        }

        anomalies
    }
}
