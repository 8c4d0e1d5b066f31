//! Alert emission for high-severity anomalies.
//!
//! Best-effort by contract: a failing or slow sink must never block event
//! persistence, so emitters swallow their own errors.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::pipeline::anomaly::{Anomaly, AnomalySeverity};

/// Anomalies at or above this severity are alerted
pub fn should_alert(anomaly: &Anomaly) -> bool {
    anomaly.severity >= AnomalySeverity::High
}

/// Pluggable alert destination.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, anomaly: &Anomaly);
}

/// Default sink: one structured JSON record per alert on stderr.
pub struct StderrAlertSink;

#[async_trait]
impl AlertSink for StderrAlertSink {
    async fn emit(&self, anomaly: &Anomaly) {
        match serde_json::to_string(anomaly) {
            Ok(line) => eprintln!("{}", line),
            Err(e) => warn!(error = %e, "failed to serialize alert"),
        }
    }
}

/// Collects alerts in memory; used by tests.
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Anomaly>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Anomaly> {
        self.alerts.lock().expect("alert sink poisoned").clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn emit(&self, anomaly: &Anomaly) {
        self.alerts
            .lock()
            .expect("alert sink poisoned")
            .push(anomaly.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::anomaly::AnomalyType;
    use chrono::Utc;
    use uuid::Uuid;

    fn anomaly(anomaly_type: AnomalyType) -> Anomaly {
        Anomaly {
            anomaly_id: Uuid::new_v4().to_string(),
            event_id: None,
            timestamp: Utc::now(),
            anomaly_type,
            severity: anomaly_type.severity(),
            description: "test".into(),
            details: serde_json::Value::Null,
            recommended_action: String::new(),
        }
    }

    #[test]
    fn only_high_and_critical_alert() {
        assert!(!should_alert(&anomaly(AnomalyType::HighLatency))); // medium
        assert!(should_alert(&anomaly(AnomalyType::HighCost))); // high
        assert!(should_alert(&anomaly(AnomalyType::PromptInjection))); // critical
    }

    #[tokio::test]
    async fn memory_sink_collects() {
        let sink = MemoryAlertSink::new();
        sink.emit(&anomaly(AnomalyType::HighCost)).await;
        assert_eq!(sink.received().len(), 1);
    }
}
