//! PII redaction strategies.
//!
//! Replaces detected spans before text leaves the gateway. `tokenize` is
//! reversible within a single process: each distinct value maps to a stable
//! opaque token held only in memory, and `detokenize` restores the original.
//! The map is never written to any audit or storage sink.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detection::pii::{PiiMatch, PiiType};
use crate::hash;

/// How detected PII spans are replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedactionStrategy {
    /// Replace with a typed placeholder, e.g. `[EMAIL REDACTED]`
    #[default]
    Redact,
    /// Replace every character with `*`, preserving length
    Mask,
    /// Replace with a short content hash
    Hash,
    /// Replace with a stable opaque token; reversible via `detokenize`
    Tokenize,
}

impl std::str::FromStr for RedactionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redact" => Ok(RedactionStrategy::Redact),
            "mask" => Ok(RedactionStrategy::Mask),
            "hash" => Ok(RedactionStrategy::Hash),
            "tokenize" => Ok(RedactionStrategy::Tokenize),
            _ => Err(format!("Invalid redaction strategy: {}", s)),
        }
    }
}

/// Process-lifetime map from PII values to opaque tokens.
///
/// Tokens are stable per distinct value, so repeated occurrences of the same
/// email produce the same token within one process. Cleared on shutdown by
/// virtue of living only in memory.
pub struct PiiTokenizer {
    forward: DashMap<String, String>,
    reverse: DashMap<String, String>,
    next: AtomicU64,
}

impl Default for PiiTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiTokenizer {
    pub fn new() -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Get or assign the stable token for a value.
    pub fn tokenize_value(&self, pii_type: &PiiType, value: &str) -> String {
        if let Some(existing) = self.forward.get(value) {
            return existing.clone();
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let token = format!("[[PII:{}:{:06}]]", pii_type.label(), n);
        // A racing insert for the same value keeps the first token
        let token = self
            .forward
            .entry(value.to_string())
            .or_insert(token)
            .clone();
        self.reverse.insert(token.clone(), value.to_string());
        token
    }

    /// Restore all tokens in `text` to their original values.
    ///
    /// Unknown tokens (from another process, or fabricated) are left as-is.
    pub fn detokenize(&self, text: &str) -> String {
        static TOKEN_PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        let pattern = TOKEN_PATTERN.get_or_init(|| {
            Regex::new(r"\[\[PII:[^:\]]+:\d{6}\]\]").expect("token pattern is valid")
        });
        let mut result = String::with_capacity(text.len());
        let mut last_end = 0;
        for m in pattern.find_iter(text) {
            result.push_str(&text[last_end..m.start()]);
            match self.reverse.get(m.as_str()) {
                Some(original) => result.push_str(&original),
                None => result.push_str(m.as_str()),
            }
            last_end = m.end();
        }
        result.push_str(&text[last_end..]);
        result
    }
}

/// Applies a [`RedactionStrategy`] to detected spans.
pub struct Redactor<'a> {
    strategy: RedactionStrategy,
    tokenizer: &'a PiiTokenizer,
}

impl<'a> Redactor<'a> {
    pub fn new(strategy: RedactionStrategy, tokenizer: &'a PiiTokenizer) -> Self {
        Self {
            strategy,
            tokenizer,
        }
    }

    /// Replace every match span in `text` according to the strategy.
    ///
    /// `matches` must be sorted and non-overlapping, which is what
    /// [`PiiDetector::scan`](crate::detection::pii::PiiDetector::scan)
    /// produces.
    pub fn apply(&self, text: &str, matches: &[PiiMatch]) -> String {
        if matches.is_empty() {
            return text.to_string();
        }

        let mut result = String::with_capacity(text.len());
        let mut last_end = 0;
        for m in matches {
            result.push_str(&text[last_end..m.start]);
            let value = &text[m.start..m.end];
            match self.strategy {
                RedactionStrategy::Redact => result.push_str(&m.value_redacted),
                RedactionStrategy::Mask => {
                    result.extend(std::iter::repeat('*').take(value.chars().count()))
                }
                RedactionStrategy::Hash => {
                    result.push_str(&format!("[sha256:{}]", hash::fingerprint(value)))
                }
                RedactionStrategy::Tokenize => {
                    result.push_str(&self.tokenizer.tokenize_value(&m.pii_type, value))
                }
            }
            last_end = m.end;
        }
        result.push_str(&text[last_end..]);
        result
    }
}
