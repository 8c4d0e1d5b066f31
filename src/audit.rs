//! Append-only audit log.
//!
//! One newline-delimited JSON record per security-relevant event. Records
//! carry hashes and type labels only — raw prompts, responses, and PII values
//! must never reach this sink.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Category of an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Authz,
    Pii,
    Processing,
    Violation,
}

/// A single audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub principal_hash: String,
    pub event_type: AuditEventType,
    pub outcome: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
}

impl AuditRecord {
    pub fn new(
        event_type: AuditEventType,
        request_id: &str,
        principal_hash: &str,
        outcome: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            principal_hash: principal_hash.to_string(),
            event_type,
            outcome: outcome.to_string(),
            attrs: BTreeMap::new(),
        }
    }

    /// Attach a structured attribute
    pub fn with_attr(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }
}

/// Append-only NDJSON writer.
///
/// Recording is best-effort: a failed write is logged and dropped rather than
/// failing the request path.
pub struct AuditLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AuditLog {
    /// Append to a file, creating it if needed.
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Write records to stderr.
    pub fn stderr() -> Self {
        Self {
            writer: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    /// In-memory log for tests; the returned buffer reads back records.
    pub fn memory() -> (Self, AuditBuffer) {
        let buffer = AuditBuffer::default();
        let log = Self {
            writer: Mutex::new(Box::new(buffer.clone())),
        };
        (log, buffer)
    }

    /// Append one record.
    pub fn record(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        let mut writer = self.writer.lock().expect("audit writer poisoned");
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!(error = %e, "failed to append audit record");
        }
    }
}

/// Shared in-memory sink used by tests
#[derive(Clone, Default)]
pub struct AuditBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl AuditBuffer {
    /// Parse all recorded NDJSON lines back into records
    pub fn records(&self) -> Vec<AuditRecord> {
        let bytes = self.bytes.lock().expect("audit buffer poisoned");
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Raw NDJSON contents, for leak checks
    pub fn raw(&self) -> String {
        let bytes = self.bytes.lock().expect("audit buffer poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

impl Write for AuditBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes
            .lock()
            .expect("audit buffer poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_memory_log() {
        let (log, buffer) = AuditLog::memory();
        log.record(
            &AuditRecord::new(AuditEventType::Authz, "req-1", "hash-1", "denied")
                .with_attr("reason", "missing pii_access"),
        );
        log.record(&AuditRecord::new(
            AuditEventType::Processing,
            "req-1",
            "hash-1",
            "ok",
        ));

        let records = buffer.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, AuditEventType::Authz);
        assert_eq!(records[0].outcome, "denied");
        assert_eq!(
            records[0].attrs.get("reason").unwrap(),
            "missing pii_access"
        );
    }

    #[test]
    fn file_log_appends_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let log = AuditLog::to_file(&path).unwrap();
        log.record(&AuditRecord::new(
            AuditEventType::Violation,
            "req-2",
            "hash-2",
            "pii_blocked",
        ));
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        let record: AuditRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(record.event_type, AuditEventType::Violation);
    }

    #[test]
    fn event_types_use_snake_case_wire_names() {
        assert_eq!(
            serde_json::to_string(&AuditEventType::Violation).unwrap(),
            "\"violation\""
        );
    }
}
