//! PII (Personally Identifiable Information) detection.
//!
//! Pattern-based detector over prompt text. The recognized type set and the
//! patterns themselves are enumerated configuration; unknown type names are
//! rejected at load time. The detector is pure and stateless.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Types of PII that can be detected.
///
/// The five built-in types are always recognized; deployments may declare
/// additional named types in configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PiiType {
    Email,
    Phone,
    Ssn,
    CreditCard,
    IpAddress,
    Custom(String),
}

impl PiiType {
    /// Get the display name for this PII type
    pub fn label(&self) -> &str {
        match self {
            PiiType::Email => "email",
            PiiType::Phone => "phone",
            PiiType::Ssn => "ssn",
            PiiType::CreditCard => "credit_card",
            PiiType::IpAddress => "ip_address",
            PiiType::Custom(name) => name,
        }
    }

    /// Get the redaction placeholder for this PII type
    pub fn redaction(&self) -> String {
        format!("[{} REDACTED]", self.label().to_uppercase())
    }

    /// Resolve a configured type name, rejecting anything not built in and
    /// not explicitly declared.
    pub fn parse(name: &str, declared_custom: &[String]) -> Result<Self, PiiConfigError> {
        match name {
            "email" => Ok(PiiType::Email),
            "phone" => Ok(PiiType::Phone),
            "ssn" => Ok(PiiType::Ssn),
            "credit_card" => Ok(PiiType::CreditCard),
            "ip_address" => Ok(PiiType::IpAddress),
            other if declared_custom.iter().any(|c| c == other) => {
                Ok(PiiType::Custom(other.to_string()))
            }
            other => Err(PiiConfigError::UnknownType(other.to_string())),
        }
    }
}

/// A configured detection pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiPattern {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PiiConfigError {
    #[error("unknown PII type `{0}`")]
    UnknownType(String),
    #[error("invalid pattern for `{name}`: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// A single match within the scanned text.
///
/// Carries only the span and the redacted placeholder; the raw value is
/// recoverable from the text by span when a redactor needs it, and never
/// travels further than that.
#[derive(Debug, Clone)]
pub struct PiiMatch {
    pub pii_type: PiiType,
    pub start: usize,
    pub end: usize,
    pub value_redacted: String,
}

/// Outcome of a PII scan over one prompt
#[derive(Debug, Clone, Default)]
pub struct PiiResult {
    pub has_pii: bool,
    pub types: BTreeSet<PiiType>,
    pub matches: Vec<PiiMatch>,
}

impl PiiResult {
    /// Type labels for events and audit attributes
    pub fn type_labels(&self) -> Vec<String> {
        self.types.iter().map(|t| t.label().to_string()).collect()
    }
}

/// Detector for personally identifiable information
#[derive(Debug)]
pub struct PiiDetector {
    patterns: Vec<(PiiType, Regex)>,
}

impl Default for PiiDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiDetector {
    /// Create a detector with the built-in pattern set
    pub fn new() -> Self {
        Self::with_patterns(&[], &[]).expect("built-in patterns are valid")
    }

    /// Create a detector with the built-in patterns plus configured extras.
    ///
    /// Every extra pattern must name a built-in type or a declared custom
    /// type; anything else is rejected here rather than silently ignored.
    pub fn with_patterns(
        extra: &[PiiPattern],
        declared_custom: &[String],
    ) -> Result<Self, PiiConfigError> {
        let mut patterns: Vec<(PiiType, Regex)> = vec![
            (
                PiiType::Email,
                Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap(),
            ),
            (
                PiiType::Ssn,
                Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            ),
            (
                PiiType::Phone,
                Regex::new(r"\b(?:\+1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap(),
            ),
            (
                PiiType::CreditCard,
                Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap(),
            ),
            (
                PiiType::IpAddress,
                Regex::new(
                    r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
                )
                .unwrap(),
            ),
        ];

        for p in extra {
            let pii_type = PiiType::parse(&p.name, declared_custom)?;
            let regex = Regex::new(&p.pattern).map_err(|source| PiiConfigError::InvalidPattern {
                name: p.name.clone(),
                source,
            })?;
            patterns.push((pii_type, regex));
        }

        Ok(Self { patterns })
    }

    /// Scan text and return all non-overlapping matches.
    ///
    /// Overlaps are resolved earliest-start first, with the longest match
    /// winning a shared start position.
    pub fn scan(&self, text: &str) -> PiiResult {
        let mut raw: Vec<PiiMatch> = Vec::new();
        for (pii_type, regex) in &self.patterns {
            for m in regex.find_iter(text) {
                if *pii_type == PiiType::IpAddress && is_private_ip(m.as_str()) {
                    continue;
                }
                raw.push(PiiMatch {
                    pii_type: pii_type.clone(),
                    start: m.start(),
                    end: m.end(),
                    value_redacted: pii_type.redaction(),
                });
            }
        }

        // Earliest start wins; at equal start the longest match wins
        raw.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

        let mut matches: Vec<PiiMatch> = Vec::new();
        let mut cursor = 0usize;
        for m in raw {
            if m.start >= cursor {
                cursor = m.end;
                matches.push(m);
            }
        }

        let types: BTreeSet<PiiType> = matches.iter().map(|m| m.pii_type.clone()).collect();
        PiiResult {
            has_pii: !matches.is_empty(),
            types,
            matches,
        }
    }
}

/// Skip localhost and common private ranges to cut noise
fn is_private_ip(ip: &str) -> bool {
    ip.starts_with("127.")
        || ip.starts_with("10.")
        || ip.starts_with("192.168.")
        || ip.starts_with("0.")
}
