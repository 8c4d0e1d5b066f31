//! Backend selection.
//!
//! A pure function over the registry snapshot: filter by hard constraints,
//! apply the caller's hint, rank by a composite cost/latency/quality score,
//! and emit a cascade of primary plus fallbacks. No I/O, no clock, no state —
//! everything the decision depends on arrives in the query.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::registry::{Backend, BackendType, Capability, RegistrySnapshot};
use crate::request::{ProcessingHint, Sensitivity};

/// Score weights for candidate ranking. Lower composite score wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterWeights {
    pub cost: f64,
    pub latency: f64,
    pub quality: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            cost: 0.5,
            latency: 0.3,
            quality: 0.2,
        }
    }
}

/// Everything a routing decision depends on
#[derive(Debug, Clone)]
pub struct RouteQuery<'a> {
    pub capability: Capability,
    pub sensitivity: Sensitivity,
    pub hint: ProcessingHint,
    pub max_cost_usd: Option<f64>,
    pub max_latency_ms: Option<u64>,
    pub estimated_tokens: u32,
    pub has_pii: bool,
    pub prior_failures: &'a HashSet<String>,
}

/// Ordered candidate list plus decision metadata
#[derive(Debug, Clone, Default)]
pub struct RouteDecision {
    /// Primary first, then fallbacks in cascade order. Empty when nothing
    /// survives filtering.
    pub candidates: Vec<String>,
    /// The hint restricted to a type with no surviving member, so the full
    /// candidate set was used instead.
    pub hint_ignored: bool,
    /// Candidates that passed every predicate except PII compatibility.
    /// Nonzero with an empty candidate list means the request was blocked by
    /// PII routing, not by absence of capable backends.
    pub pii_excluded: usize,
}

struct Candidate<'a> {
    descriptor: &'a Backend,
    request_cost: f64,
}

/// Select backends for a request.
pub fn route(
    snapshot: &RegistrySnapshot,
    query: &RouteQuery<'_>,
    weights: &RouterWeights,
    use_cascade: bool,
    max_fallbacks: usize,
) -> RouteDecision {
    let mut decision = RouteDecision::default();

    // Step 1: hard filters
    let mut candidates: Vec<Candidate> = Vec::new();
    for entry in snapshot.iter() {
        let b = &entry.descriptor;
        if !b.capabilities.contains(&query.capability) {
            continue;
        }
        if !b.sensitivity_allowed.contains(&query.sensitivity) {
            continue;
        }
        if query.sensitivity == Sensitivity::Confidential && !b.confidential_allowed {
            continue;
        }
        let request_cost = b.estimate_cost(query.estimated_tokens);
        if let Some(max_cost) = query.max_cost_usd {
            if request_cost > max_cost {
                continue;
            }
        }
        if let Some(max_latency) = query.max_latency_ms {
            if b.avg_latency_ms > max_latency {
                continue;
            }
        }
        if query.prior_failures.contains(&b.id) {
            continue;
        }
        // PII compatibility last, so exclusions here are attributable
        if query.has_pii && !b.pii_allowed {
            decision.pii_excluded += 1;
            continue;
        }
        candidates.push(Candidate {
            descriptor: b,
            request_cost,
        });
    }

    if candidates.is_empty() {
        return decision;
    }

    // Step 2: hint restriction, falling back to the full set when the hinted
    // type has no surviving member
    if let Some(hinted_type) = BackendType::for_hint(query.hint) {
        if candidates
            .iter()
            .any(|c| c.descriptor.backend_type == hinted_type)
        {
            candidates.retain(|c| c.descriptor.backend_type == hinted_type);
        } else {
            decision.hint_ignored = true;
        }
    }

    // Step 3: composite score over min–max normalized cost and latency
    let (cost_min, cost_max) = min_max(candidates.iter().map(|c| c.request_cost));
    let (lat_min, lat_max) = min_max(candidates.iter().map(|c| c.descriptor.avg_latency_ms as f64));

    let mut ranked: Vec<(f64, &Backend)> = candidates
        .iter()
        .map(|c| {
            let cost_n = normalize(c.request_cost, cost_min, cost_max);
            let lat_n = normalize(c.descriptor.avg_latency_ms as f64, lat_min, lat_max);
            let score = weights.cost * cost_n + weights.latency * lat_n
                - weights.quality * c.descriptor.confidence_threshold;
            (score, c.descriptor)
        })
        .collect();

    ranked.sort_by(|(sa, a), (sb, b)| {
        sa.partial_cmp(sb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    // Step 4: cascade — each fallback must be at least as capable as its
    // predecessor (non-decreasing confidence threshold)
    let mut selected: Vec<String> = Vec::new();
    let mut last_threshold = f64::NEG_INFINITY;
    for (_, backend) in &ranked {
        if selected.is_empty() {
            selected.push(backend.id.clone());
            last_threshold = backend.confidence_threshold;
            if !use_cascade {
                break;
            }
            continue;
        }
        if selected.len() > max_fallbacks {
            break;
        }
        if backend.confidence_threshold >= last_threshold {
            selected.push(backend.id.clone());
            last_threshold = backend.confidence_threshold;
            if selected.len() > max_fallbacks {
                break;
            }
        }
    }

    decision.candidates = selected;
    decision
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

/// Min–max normalize; a degenerate range (all equal, including all-free
/// backends) normalizes to 0 so the remaining weights dominate.
fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max > min {
        (value - min) / (max - min)
    } else {
        0.0
    }
}
