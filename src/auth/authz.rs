//! RBAC + ABAC authorization.
//!
//! A request is authorized iff the principal holds the action's permission and
//! every attribute constraint on the resource is satisfied. Denials carry a
//! human-readable reason; the wire code stays coarse (`AUTHZ_DENIED`).

use std::collections::HashMap;

use crate::auth::token::{Permission, Principal};
use crate::request::Sensitivity;

/// Attributes of the resource being accessed
#[derive(Debug, Clone, Copy)]
pub struct ResourceContext {
    pub sensitivity: Sensitivity,
    pub estimated_cost_usd: f64,
}

/// Evaluates authorization decisions against configured cost ceilings.
pub struct Authorizer {
    default_cost_ceiling_usd: f64,
    cost_ceilings: HashMap<String, f64>,
}

impl Authorizer {
    pub fn new(default_cost_ceiling_usd: f64, cost_ceilings: HashMap<String, f64>) -> Self {
        Self {
            default_cost_ceiling_usd,
            cost_ceilings,
        }
    }

    /// Effective cost ceiling for a principal.
    ///
    /// A token-carried ceiling can only lower the configured one.
    pub fn cost_ceiling(&self, principal: &Principal) -> f64 {
        let configured = self
            .cost_ceilings
            .get(&principal.subject)
            .copied()
            .unwrap_or(self.default_cost_ceiling_usd);
        match principal.cost_ceiling {
            Some(claimed) => configured.min(claimed),
            None => configured,
        }
    }

    /// Decide whether `principal` may perform `action` on the resource.
    pub fn authorize(
        &self,
        principal: &Principal,
        action: Permission,
        resource: &ResourceContext,
    ) -> Result<(), String> {
        if !principal.has(action) {
            return Err(format!("missing `{}` permission", action.as_str()));
        }

        match resource.sensitivity {
            Sensitivity::Pii => {
                if !principal.has(Permission::PiiAccess) {
                    return Err("pii sensitivity requires `pii_access`".to_string());
                }
            }
            Sensitivity::Sensitive | Sensitivity::Confidential => {
                if !principal.has(Permission::SensitiveAccess) {
                    return Err(format!(
                        "{} sensitivity requires `sensitive_access`",
                        resource.sensitivity.as_str()
                    ));
                }
            }
            Sensitivity::Public | Sensitivity::Internal => {}
        }

        let ceiling = self.cost_ceiling(principal);
        if resource.estimated_cost_usd > ceiling {
            return Err(format!(
                "estimated cost ${:.4} exceeds ceiling ${:.4}",
                resource.estimated_cost_usd, ceiling
            ));
        }

        Ok(())
    }
}
