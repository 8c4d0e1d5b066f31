//! Backend registry.
//!
//! In-memory catalog of backend descriptors paired with their adapters.
//! Read-mostly: request handling only ever sees an immutable snapshot, and
//! reloads swap the whole snapshot atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::backends::BackendAdapter;
use crate::request::{ProcessingHint, Sensitivity};

/// Kind of processing engine behind an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    LlmLarge,
    LlmSmall,
    LlmPrivate,
    RuleEngine,
    Hybrid,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::LlmLarge => "llm_large",
            BackendType::LlmSmall => "llm_small",
            BackendType::LlmPrivate => "llm_private",
            BackendType::RuleEngine => "rule_engine",
            BackendType::Hybrid => "hybrid",
        }
    }

    /// The backend type a processing hint restricts to, if any
    pub fn for_hint(hint: ProcessingHint) -> Option<BackendType> {
        match hint {
            ProcessingHint::Auto => None,
            ProcessingHint::RuleEngine => Some(BackendType::RuleEngine),
            ProcessingHint::ModelSmall => Some(BackendType::LlmSmall),
            ProcessingHint::ModelLarge => Some(BackendType::LlmLarge),
            ProcessingHint::ModelPrivate => Some(BackendType::LlmPrivate),
            ProcessingHint::Hybrid => Some(BackendType::Hybrid),
        }
    }
}

/// Task category a backend claims to serve
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    Classification,
    Extraction,
    Summarization,
    CodeGeneration,
    SecurityScan,
    Analysis,
    Translation,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TextGeneration => "text_generation",
            Capability::Classification => "classification",
            Capability::Extraction => "extraction",
            Capability::Summarization => "summarization",
            Capability::CodeGeneration => "code_generation",
            Capability::SecurityScan => "security_scan",
            Capability::Analysis => "analysis",
            Capability::Translation => "translation",
        }
    }
}

/// Descriptor of a registered backend.
///
/// Shared immutably during request handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub capabilities: BTreeSet<Capability>,
    pub cost_per_1k_tokens: f64,
    pub avg_latency_ms: u64,
    pub max_tokens: u32,
    pub confidence_threshold: f64,
    pub pii_allowed: bool,
    /// Stricter than `pii_allowed`; required for `confidential` traffic.
    #[serde(default)]
    pub confidential_allowed: bool,
    pub sensitivity_allowed: BTreeSet<Sensitivity>,
}

impl Backend {
    /// Check the descriptor invariants.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let fail = |reason: &str| {
            Err(RegistryError::InvalidDescriptor {
                id: self.id.clone(),
                reason: reason.to_string(),
            })
        };
        if self.id.is_empty() {
            return fail("id must be non-empty");
        }
        if self.cost_per_1k_tokens < 0.0 {
            return fail("cost_per_1k_tokens must be >= 0");
        }
        if self.max_tokens == 0 {
            return fail("max_tokens must be > 0");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return fail("confidence_threshold must be within [0, 1]");
        }
        if self.pii_allowed && !self.sensitivity_allowed.contains(&Sensitivity::Pii) {
            return fail("pii_allowed requires `pii` in sensitivity_allowed");
        }
        if self.confidential_allowed && !self.pii_allowed {
            return fail("confidential_allowed requires pii_allowed");
        }
        Ok(())
    }

    /// Estimated cost of one request at this backend's rate
    pub fn estimate_cost(&self, tokens: u32) -> f64 {
        (tokens as f64 / 1000.0) * self.cost_per_1k_tokens
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate backend id `{0}`")]
    DuplicateId(String),
    #[error("invalid backend `{id}`: {reason}")]
    InvalidDescriptor { id: String, reason: String },
}

/// A descriptor paired with its live adapter
#[derive(Clone)]
pub struct RegisteredBackend {
    pub descriptor: Backend,
    pub adapter: Arc<dyn BackendAdapter>,
}

/// Immutable view of the registry at one point in time
pub struct RegistrySnapshot {
    backends: BTreeMap<String, RegisteredBackend>,
}

impl RegistrySnapshot {
    fn build(
        entries: Vec<(Backend, Arc<dyn BackendAdapter>)>,
    ) -> Result<Self, RegistryError> {
        let mut backends = BTreeMap::new();
        for (descriptor, adapter) in entries {
            descriptor.validate()?;
            let id = descriptor.id.clone();
            let replaced = backends.insert(
                id.clone(),
                RegisteredBackend {
                    descriptor,
                    adapter,
                },
            );
            if replaced.is_some() {
                return Err(RegistryError::DuplicateId(id));
            }
        }
        Ok(Self { backends })
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredBackend> {
        self.backends.get(id)
    }

    /// Iterate descriptors in id order (deterministic)
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.values()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Registry handle shared across workers.
///
/// The lock is held only for the duration of `Arc::clone`, so reads never
/// contend with a reload in any observable way.
pub struct BackendRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry").finish()
    }
}

impl BackendRegistry {
    pub fn new(
        entries: Vec<(Backend, Arc<dyn BackendAdapter>)>,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::build(entries)?)),
        })
    }

    /// Current snapshot; stable for the caller's lifetime of the `Arc`.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    /// Replace the registry contents atomically.
    ///
    /// In-flight requests keep the snapshot they started with.
    pub fn reload(
        &self,
        entries: Vec<(Backend, Arc<dyn BackendAdapter>)>,
    ) -> Result<(), RegistryError> {
        let next = Arc::new(RegistrySnapshot::build(entries)?);
        *self.snapshot.write().expect("registry lock poisoned") = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::stub::StaticLlmAdapter;

    fn descriptor(id: &str) -> Backend {
        Backend {
            id: id.into(),
            backend_type: BackendType::LlmSmall,
            capabilities: [Capability::TextGeneration].into(),
            cost_per_1k_tokens: 0.001,
            avg_latency_ms: 150,
            max_tokens: 4096,
            confidence_threshold: 0.7,
            pii_allowed: false,
            confidential_allowed: false,
            sensitivity_allowed: [Sensitivity::Public, Sensitivity::Internal].into(),
        }
    }

    fn entry(id: &str) -> (Backend, Arc<dyn BackendAdapter>) {
        let d = descriptor(id);
        let adapter: Arc<dyn BackendAdapter> = Arc::new(StaticLlmAdapter::new(d.clone()));
        (d, adapter)
    }

    #[test]
    fn registers_and_looks_up_backends() {
        let registry = BackendRegistry::new(vec![entry("a"), entry("b")]).unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get("a").is_some());
        assert!(snapshot.get("missing").is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = BackendRegistry::new(vec![entry("a"), entry("a")]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
    }

    #[test]
    fn pii_allowed_requires_pii_sensitivity() {
        let mut d = descriptor("bad");
        d.pii_allowed = true; // sensitivity_allowed lacks `pii`
        assert!(d.validate().is_err());

        d.sensitivity_allowed.insert(Sensitivity::Pii);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn confidential_requires_pii_allowed() {
        let mut d = descriptor("bad");
        d.confidential_allowed = true;
        assert!(d.validate().is_err());
    }

    #[test]
    fn descriptor_bounds_are_enforced() {
        let mut d = descriptor("bad");
        d.cost_per_1k_tokens = -0.1;
        assert!(d.validate().is_err());

        let mut d = descriptor("bad");
        d.max_tokens = 0;
        assert!(d.validate().is_err());

        let mut d = descriptor("bad");
        d.confidence_threshold = 1.5;
        assert!(d.validate().is_err());
    }

    #[test]
    fn reload_swaps_snapshot_without_touching_existing() {
        let registry = BackendRegistry::new(vec![entry("a")]).unwrap();
        let before = registry.snapshot();
        registry.reload(vec![entry("b")]).unwrap();

        // Old snapshot is unchanged; new one sees the reloaded set
        assert!(before.get("a").is_some());
        let after = registry.snapshot();
        assert!(after.get("a").is_none());
        assert!(after.get("b").is_some());
    }

    #[test]
    fn hint_maps_to_backend_type() {
        assert_eq!(BackendType::for_hint(ProcessingHint::Auto), None);
        assert_eq!(
            BackendType::for_hint(ProcessingHint::ModelLarge),
            Some(BackendType::LlmLarge)
        );
        assert_eq!(
            BackendType::for_hint(ProcessingHint::RuleEngine),
            Some(BackendType::RuleEngine)
        );
    }
}
