//! Bearer token verification.
//!
//! Tokens are signed JSON claims (HS256). Verification is delegated to
//! `jsonwebtoken`; the shared secret comes from configuration and is never
//! logged. An expired token is the only authentication failure that gets its
//! own error code; everything else collapses to `AUTH_INVALID`.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Coarse role carried in token claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Service,
    ReadOnly,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Service => "service",
            Role::ReadOnly => "read_only",
        }
    }

    /// Permissions implied by the role, unioned with any explicit grants.
    pub fn default_permissions(&self) -> &'static [Permission] {
        match self {
            Role::Admin => &[
                Permission::Read,
                Permission::Write,
                Permission::Execute,
                Permission::Admin,
                Permission::PiiAccess,
                Permission::SensitiveAccess,
            ],
            Role::Service => &[Permission::Read, Permission::Execute],
            Role::ReadOnly => &[Permission::Read],
        }
    }
}

/// Fine-grained action/attribute permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Execute,
    Admin,
    PiiAccess,
    SensitiveAccess,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Execute => "execute",
            Permission::Admin => "admin",
            Permission::PiiAccess => "pii_access",
            Permission::SensitiveAccess => "sensitive_access",
        }
    }
}

/// Signed token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    pub iat: i64,
    pub exp: i64,
    /// Optional per-token cost ceiling; can only lower the configured ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_ceiling: Option<f64>,
}

/// Authenticated identity derived from a token. Never persisted.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub role: Role,
    pub permissions: HashSet<Permission>,
    pub expires_at: DateTime<Utc>,
    pub cost_ceiling: Option<f64>,
}

impl Principal {
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Verifies bearer tokens and derives a [`Principal`].
pub struct TokenService {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl TokenService {
    /// Create a token service from the shared secret.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a token and derive the principal.
    ///
    /// Role defaults are unioned with any explicit permission grants in the
    /// claims, so the role→permission closure always holds.
    pub fn authenticate(&self, token: &str) -> Result<Principal, GatewayError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::AuthExpired,
                _ => GatewayError::AuthInvalid,
            }
        })?;
        let claims = data.claims;

        let mut permissions: HashSet<Permission> =
            claims.role.default_permissions().iter().copied().collect();
        permissions.extend(claims.permissions.iter().copied());

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(GatewayError::AuthInvalid)?;

        Ok(Principal {
            subject: claims.sub,
            role: claims.role,
            permissions,
            expires_at,
            cost_ceiling: claims.cost_ceiling,
        })
    }

    /// Sign a set of claims.
    ///
    /// Used by tests and local tooling; production tokens are minted by the
    /// identity provider, not by the gateway.
    pub fn issue(&self, claims: &Claims) -> Result<String, GatewayError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|_| GatewayError::AuthInvalid)
    }
}
