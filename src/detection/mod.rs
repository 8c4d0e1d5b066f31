//! Security screening over prompt text.

pub mod injection;
pub mod pii;
pub mod redaction;

pub use injection::{InjectionDetector, InjectionFamily, InjectionFinding};
pub use pii::{PiiDetector, PiiMatch, PiiPattern, PiiResult, PiiType};
pub use redaction::{PiiTokenizer, Redactor, RedactionStrategy};
