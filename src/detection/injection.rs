//! Prompt injection detection.
//!
//! Detects attempts to override system instructions or force the model out of
//! its guardrails. Two pattern families feed the same flag: direct
//! instruction-override injection and jailbreak-style persona forcing. A hit
//! never blocks a request on its own; it raises the event risk level and the
//! anomaly detector escalates from there.

use regex::RegexSet;

/// Patterns that indicate direct instruction-override attempts
const OVERRIDE_PATTERNS: &[&str] = &[
    // Instruction override
    r"(?i)ignore\s+(all\s+)?previous\s+instructions?",
    r"(?i)ignore\s+(all\s+)?prior\s+instructions?",
    r"(?i)disregard\s+(all\s+)?(previous|prior)",
    r"(?i)forget\s+(all\s+)?(your\s+)?instructions?",
    r"(?i)override\s+(your\s+)?instructions?",
    // New instruction injection
    r"(?i)new\s+instructions?:",
    r"(?i)updated\s+instructions?:",
    r"(?i)system\s+prompt:",
    r"(?i)\[system\]",
    r"(?i)<system>",
    // Prompt extraction
    r"(?i)reveal\s+(your\s+)?system\s+prompt",
    r"(?i)show\s+(me\s+)?(your\s+)?instructions",
    r"(?i)print\s+(your\s+)?initial\s+prompt",
    // Role-token injection
    r"(?i)</?(system|instructions?)>",
    r"(?i)\[/?INST\]",
    r"(?i)<<SYS>>",
    r"(?i)end\s+of\s+system\s+prompt",
];

/// Patterns that indicate jailbreak-style persona forcing
const JAILBREAK_PATTERNS: &[&str] = &[
    r"(?i)\bDAN\b",
    r"(?i)do\s+anything\s+now",
    r"(?i)jail\s*break",
    r"(?i)developer\s+mode",
    r"(?i)sudo\s+mode",
    r"(?i)god\s+mode",
    r"(?i)bypass\s+(your\s+)?(programming|restrictions|filters|safety|guidelines)",
    r"(?i)circumvent\s+(your\s+)?rules",
    r"(?i)ignore\s+(your\s+)?(ethical|moral|safety)",
    r"(?i)without\s+(any\s+)?restrictions",
    r"(?i)unrestricted\s+mode",
    r"(?i)you\s+are\s+now\s+a",
    r"(?i)pretend\s+(to\s+be|you\s+are)",
    r"(?i)uncensored\s+(version|mode)",
    r"(?i)unfiltered\s+(version|mode)",
];

/// Which pattern family produced a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionFamily {
    InstructionOverride,
    Jailbreak,
}

impl InjectionFamily {
    pub fn label(&self) -> &'static str {
        match self {
            InjectionFamily::InstructionOverride => "instruction_override",
            InjectionFamily::Jailbreak => "jailbreak",
        }
    }
}

/// A positive injection detection
#[derive(Debug, Clone, Copy)]
pub struct InjectionFinding {
    pub family: InjectionFamily,
}

/// Detector for prompt injection attempts
pub struct InjectionDetector {
    overrides: RegexSet,
    jailbreaks: RegexSet,
}

impl Default for InjectionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl InjectionDetector {
    /// Create a new injection detector
    pub fn new() -> Self {
        Self {
            overrides: RegexSet::new(OVERRIDE_PATTERNS)
                .expect("Failed to compile injection patterns"),
            jailbreaks: RegexSet::new(JAILBREAK_PATTERNS)
                .expect("Failed to compile jailbreak patterns"),
        }
    }

    /// Check if text contains an injection attempt
    pub fn detect(&self, text: &str) -> Option<InjectionFinding> {
        if self.overrides.is_match(text) {
            return Some(InjectionFinding {
                family: InjectionFamily::InstructionOverride,
            });
        }
        if self.jailbreaks.is_match(text) {
            return Some(InjectionFinding {
                family: InjectionFamily::Jailbreak,
            });
        }
        None
    }
}
