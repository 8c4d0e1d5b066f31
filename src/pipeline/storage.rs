//! Durable event and anomaly storage.
//!
//! Append-only tables in an embedded SQLite database. Writes are serialized
//! behind a single connection (single-writer guarantee per process) and are
//! durable before the pipeline reports an event complete. Cross-process
//! concurrency is out of scope.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};

use crate::pipeline::anomaly::{Anomaly, AnomalySeverity, AnomalyType};
use crate::pipeline::event::{AiEvent, RiskLevel};
use crate::request::TokenUsage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Aggregate statistics over a time window
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_events: u64,
    pub error_count: u64,
    pub total_cost_usd: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub by_risk_level: BTreeMap<String, u64>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY,
    request_id TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    principal_hash TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt_fingerprint TEXT NOT NULL,
    response_fingerprint TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    success INTEGER NOT NULL,
    error_code TEXT,
    has_pii INTEGER NOT NULL,
    pii_types TEXT NOT NULL,
    injection_detected INTEGER NOT NULL,
    risk_level TEXT NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_ms);
CREATE INDEX IF NOT EXISTS idx_events_provider ON events(provider);
CREATE INDEX IF NOT EXISTS idx_events_model ON events(model);
CREATE INDEX IF NOT EXISTS idx_events_risk ON events(risk_level);

CREATE TABLE IF NOT EXISTS anomalies (
    id INTEGER PRIMARY KEY,
    anomaly_id TEXT NOT NULL UNIQUE,
    event_id TEXT,
    ts_ms INTEGER NOT NULL,
    type TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    details TEXT NOT NULL,
    recommended_action TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_anomalies_severity ON anomalies(severity);
CREATE INDEX IF NOT EXISTS idx_anomalies_ts ON anomalies(ts_ms);
";

/// Embedded event/anomaly store.
pub struct EventStorage {
    conn: Mutex<Connection>,
}

impl EventStorage {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::init(Connection::open(path)?)
    }

    /// Fully in-memory store, used by tests and local runs.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one event. Durable on return.
    pub fn insert_event(&self, event: &AiEvent) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        conn.execute(
            "INSERT INTO events (
                request_id, ts_ms, principal_hash, provider, model,
                prompt_fingerprint, response_fingerprint, latency_ms,
                prompt_tokens, completion_tokens, total_tokens, cost_usd,
                success, error_code, has_pii, pii_types, injection_detected,
                risk_level, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                event.request_id,
                event.timestamp.timestamp_millis(),
                event.principal_hash,
                event.provider,
                event.model,
                event.prompt_fingerprint,
                event.response_fingerprint,
                event.latency_ms as i64,
                event.tokens.prompt,
                event.tokens.completion,
                event.tokens.total,
                event.cost_usd,
                event.success,
                event.error_code,
                event.has_pii,
                serde_json::to_string(&event.pii_types).unwrap_or_else(|_| "[]".into()),
                event.injection_detected,
                event.risk_level.as_str(),
                serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".into()),
            ],
        )?;
        Ok(())
    }

    /// Append one anomaly. Durable on return.
    pub fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        conn.execute(
            "INSERT INTO anomalies (
                anomaly_id, event_id, ts_ms, type, severity, description,
                details, recommended_action
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                anomaly.anomaly_id,
                anomaly.event_id,
                anomaly.timestamp.timestamp_millis(),
                anomaly.anomaly_type.as_str(),
                anomaly.severity.as_str(),
                anomaly.description,
                anomaly.details.to_string(),
                anomaly.recommended_action,
            ],
        )?;
        Ok(())
    }

    /// Most recent `limit` events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<AiEvent>, StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT request_id, ts_ms, principal_hash, provider, model,
                    prompt_fingerprint, response_fingerprint, latency_ms,
                    prompt_tokens, completion_tokens, total_tokens, cost_usd,
                    success, error_code, has_pii, pii_types,
                    injection_detected, risk_level, metadata
             FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Most recent `limit` anomalies, newest first.
    pub fn recent_anomalies(&self, limit: usize) -> Result<Vec<Anomaly>, StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT anomaly_id, event_id, ts_ms, type, severity, description,
                    details, recommended_action
             FROM anomalies ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_anomaly)?;
        let mut anomalies = Vec::new();
        for row in rows {
            anomalies.push(row?);
        }
        Ok(anomalies)
    }

    /// Anomalies at exactly the given severity, newest first.
    pub fn anomalies_by_severity(
        &self,
        severity: AnomalySeverity,
        limit: usize,
    ) -> Result<Vec<Anomaly>, StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT anomaly_id, event_id, ts_ms, type, severity, description,
                    details, recommended_action
             FROM anomalies WHERE severity = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![severity.as_str(), limit as i64], row_to_anomaly)?;
        let mut anomalies = Vec::new();
        for row in rows {
            anomalies.push(row?);
        }
        Ok(anomalies)
    }

    /// Aggregate statistics over events at or after `since`.
    pub fn stats(&self, since: DateTime<Utc>) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        let since_ms = since.timestamp_millis();

        let (total, errors, cost, avg_latency, tokens): (i64, i64, f64, f64, i64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(cost_usd), 0.0),
                        COALESCE(AVG(latency_ms), 0.0),
                        COALESCE(SUM(total_tokens), 0)
                 FROM events WHERE ts_ms >= ?1",
                [since_ms],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )?;

        let mut by_risk_level = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT risk_level, COUNT(*) FROM events WHERE ts_ms >= ?1 GROUP BY risk_level",
        )?;
        let rows = stmt.query_map([since_ms], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (level, count) = row?;
            by_risk_level.insert(level, count.max(0) as u64);
        }

        Ok(StorageStats {
            total_events: total.max(0) as u64,
            error_count: errors.max(0) as u64,
            total_cost_usd: cost,
            avg_latency_ms: avg_latency,
            total_tokens: tokens.max(0) as u64,
            by_risk_level,
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AiEvent> {
    let ts_ms: i64 = row.get(1)?;
    let latency_ms: i64 = row.get(7)?;
    let pii_types_json: String = row.get(15)?;
    let risk: String = row.get(17)?;
    let metadata_json: String = row.get(18)?;
    Ok(AiEvent {
        request_id: row.get(0)?,
        timestamp: Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_else(Utc::now),
        principal_hash: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        prompt_fingerprint: row.get(5)?,
        response_fingerprint: row.get(6)?,
        latency_ms: latency_ms.max(0) as u64,
        tokens: TokenUsage {
            prompt: row.get(8)?,
            completion: row.get(9)?,
            total: row.get(10)?,
        },
        cost_usd: row.get(11)?,
        success: row.get(12)?,
        error_code: row.get(13)?,
        has_pii: row.get(14)?,
        pii_types: serde_json::from_str(&pii_types_json).unwrap_or_default(),
        injection_detected: row.get(16)?,
        risk_level: RiskLevel::parse(&risk).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

fn row_to_anomaly(row: &rusqlite::Row<'_>) -> rusqlite::Result<Anomaly> {
    let ts_ms: i64 = row.get(2)?;
    let type_str: String = row.get(3)?;
    let severity_str: String = row.get(4)?;
    let details_json: String = row.get(6)?;
    Ok(Anomaly {
        anomaly_id: row.get(0)?,
        event_id: row.get(1)?,
        timestamp: Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_else(Utc::now),
        anomaly_type: AnomalyType::parse(&type_str).unwrap_or(AnomalyType::RequestFailure),
        severity: AnomalySeverity::parse(&severity_str).unwrap_or(AnomalySeverity::Medium),
        description: row.get(5)?,
        details: serde_json::from_str(&details_json)
            .unwrap_or(serde_json::Value::Null),
        recommended_action: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::RiskLevel;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(model: &str, cost: f64, success: bool, risk: RiskLevel) -> AiEvent {
        AiEvent {
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            principal_hash: "hash".into(),
            provider: "llm_small".into(),
            model: model.into(),
            prompt_fingerprint: "fp".into(),
            response_fingerprint: "rf".into(),
            latency_ms: 120,
            tokens: TokenUsage::new(50, 30),
            cost_usd: cost,
            success,
            error_code: if success { None } else { Some("BACKEND_TIMEOUT".into()) },
            has_pii: false,
            pii_types: vec!["email".into()],
            injection_detected: false,
            risk_level: risk,
            metadata: BTreeMap::new(),
        }
    }

    fn anomaly(anomaly_type: AnomalyType) -> Anomaly {
        Anomaly {
            anomaly_id: Uuid::new_v4().to_string(),
            event_id: Some("req-1".into()),
            timestamp: Utc::now(),
            anomaly_type,
            severity: anomaly_type.severity(),
            description: "test".into(),
            details: serde_json::json!({ "k": 1 }),
            recommended_action: anomaly_type.recommended_action().into(),
        }
    }

    #[test]
    fn events_round_trip() {
        let storage = EventStorage::in_memory().unwrap();
        let e = event("m1", 0.02, true, RiskLevel::Medium);
        storage.insert_event(&e).unwrap();

        let loaded = storage.recent_events(10).unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.request_id, e.request_id);
        assert_eq!(got.model, "m1");
        assert_eq!(got.tokens.total, 80);
        assert_eq!(got.risk_level, RiskLevel::Medium);
        assert_eq!(got.pii_types, vec!["email".to_string()]);
    }

    #[test]
    fn recent_events_newest_first() {
        let storage = EventStorage::in_memory().unwrap();
        for i in 0..5 {
            storage
                .insert_event(&event(&format!("m{}", i), 0.01, true, RiskLevel::Low))
                .unwrap();
        }
        let loaded = storage.recent_events(3).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].model, "m4");
        assert_eq!(loaded[2].model, "m2");
    }

    #[test]
    fn anomalies_round_trip_and_filter_by_severity() {
        let storage = EventStorage::in_memory().unwrap();
        storage.insert_anomaly(&anomaly(AnomalyType::HighLatency)).unwrap(); // medium
        storage.insert_anomaly(&anomaly(AnomalyType::HighCost)).unwrap(); // high
        storage
            .insert_anomaly(&anomaly(AnomalyType::PromptInjection))
            .unwrap(); // critical

        let all = storage.recent_anomalies(10).unwrap();
        assert_eq!(all.len(), 3);

        let high = storage
            .anomalies_by_severity(AnomalySeverity::High, 10)
            .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].anomaly_type, AnomalyType::HighCost);

        let critical = storage
            .anomalies_by_severity(AnomalySeverity::Critical, 10)
            .unwrap();
        assert_eq!(critical.len(), 1);
    }

    #[test]
    fn stats_aggregate_over_window() {
        let storage = EventStorage::in_memory().unwrap();
        storage
            .insert_event(&event("m", 0.10, true, RiskLevel::Low))
            .unwrap();
        storage
            .insert_event(&event("m", 0.20, false, RiskLevel::High))
            .unwrap();

        let stats = storage
            .stats(Utc::now() - chrono::Duration::minutes(5))
            .unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.error_count, 1);
        assert!((stats.total_cost_usd - 0.30).abs() < 1e-9);
        assert_eq!(stats.total_tokens, 160);
        assert_eq!(stats.by_risk_level.get("high"), Some(&1));
    }

    #[test]
    fn stats_respect_window_boundary() {
        let storage = EventStorage::in_memory().unwrap();
        let mut old = event("m", 0.10, true, RiskLevel::Low);
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        storage.insert_event(&old).unwrap();

        let stats = storage
            .stats(Utc::now() - chrono::Duration::minutes(5))
            .unwrap();
        assert_eq!(stats.total_events, 0);
    }

    #[test]
    fn file_backed_storage_persists(){
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let storage = EventStorage::open(&path).unwrap();
            storage
                .insert_event(&event("m", 0.01, true, RiskLevel::Low))
                .unwrap();
        }
        let reopened = EventStorage::open(&path).unwrap();
        assert_eq!(reopened.recent_events(10).unwrap().len(), 1);
    }
}
