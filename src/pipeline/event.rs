//! Security events and risk scoring.
//!
//! One [`AiEvent`] is produced per request attempt-path and enriched by the
//! [`EventProcessor`] before anomaly analysis and persistence. No field ever
//! carries raw prompt or PII content; only hashes and type labels.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::TokenUsage;

/// Coarse per-event risk classification, ordered low < critical
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

/// A structured record of one gateway request attempt-path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub principal_hash: String,
    pub provider: String,
    pub model: String,
    pub prompt_fingerprint: String,
    pub response_fingerprint: String,
    pub latency_ms: u64,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub has_pii: bool,
    #[serde(default)]
    pub pii_types: Vec<String>,
    pub injection_detected: bool,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Additive risk score over the event's flags and thresholds.
pub fn risk_score(event: &AiEvent) -> u32 {
    let mut score = 0;
    if !event.success {
        score += 3;
    }
    if event.injection_detected {
        score += 4;
    }
    if event.has_pii {
        score += 2;
    }
    if event.latency_ms > 10_000 {
        score += 1;
    }
    if event.tokens.total > 10_000 {
        score += 1;
    }
    if event.cost_usd > 1.00 {
        score += 2;
    }
    score
}

/// Map a risk score to its level
pub fn risk_level_for(score: u32) -> RiskLevel {
    match score {
        s if s >= 5 => RiskLevel::Critical,
        s if s >= 3 => RiskLevel::High,
        s if s >= 1 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

/// Enriches events with their derived risk level.
///
/// A pure stage: takes an event, mutates only derived fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventProcessor;

impl EventProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, event: &mut AiEvent) {
        event.risk_level = risk_level_for(risk_score(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event() -> AiEvent {
        AiEvent {
            request_id: "req-1".into(),
            timestamp: Utc::now(),
            principal_hash: "hash".into(),
            provider: "llm_small".into(),
            model: "test-model".into(),
            prompt_fingerprint: "fp".into(),
            response_fingerprint: String::new(),
            latency_ms: 100,
            tokens: TokenUsage::new(10, 10),
            cost_usd: 0.001,
            success: true,
            error_code: None,
            has_pii: false,
            pii_types: Vec::new(),
            injection_detected: false,
            risk_level: RiskLevel::Low,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn clean_success_is_low_risk() {
        let mut event = base_event();
        EventProcessor::new().process(&mut event);
        assert_eq!(event.risk_level, RiskLevel::Low);
    }

    #[test]
    fn injection_alone_is_high() {
        let mut event = base_event();
        event.injection_detected = true;
        EventProcessor::new().process(&mut event);
        assert_eq!(event.risk_level, RiskLevel::High);
    }

    #[test]
    fn injection_on_failure_is_critical() {
        let mut event = base_event();
        event.injection_detected = true;
        event.success = false;
        EventProcessor::new().process(&mut event);
        assert_eq!(event.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn pii_alone_is_medium() {
        let mut event = base_event();
        event.has_pii = true;
        EventProcessor::new().process(&mut event);
        assert_eq!(event.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn threshold_flags_accumulate() {
        let mut event = base_event();
        event.latency_ms = 20_000;
        event.tokens = TokenUsage::new(9_000, 2_000);
        event.cost_usd = 1.50;
        // +1 latency, +1 tokens, +2 cost = 4 -> high
        EventProcessor::new().process(&mut event);
        assert_eq!(event.risk_level, RiskLevel::High);
    }

    // Risk-level monotonicity: strictly more risk-raising flags never lower
    // the level
    #[test]
    fn risk_is_monotone_in_flags() {
        let flag_setters: Vec<fn(&mut AiEvent)> = vec![
            |e| e.success = false,
            |e| e.injection_detected = true,
            |e| e.has_pii = true,
            |e| e.latency_ms = 20_000,
            |e| e.tokens = TokenUsage::new(20_000, 0),
            |e| e.cost_usd = 2.0,
        ];

        // For every subset, adding one more flag must not lower the level
        for mask in 0u32..(1 << flag_setters.len()) {
            let mut event = base_event();
            for (i, set) in flag_setters.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    set(&mut event);
                }
            }
            let level = risk_level_for(risk_score(&event));

            for (i, set) in flag_setters.iter().enumerate() {
                if mask & (1 << i) == 0 {
                    let mut more = event.clone();
                    set(&mut more);
                    let more_level = risk_level_for(risk_score(&more));
                    assert!(
                        more_level >= level,
                        "adding flag {} lowered risk: {:?} -> {:?}",
                        i,
                        level,
                        more_level
                    );
                }
            }
        }
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }
}
