//! Content fingerprints and principal hashes.
//!
//! Everything that crosses into the event pipeline or the audit log is hashed
//! here first; raw prompts, responses, and subjects never leave the gateway.

use sha2::{Digest, Sha256};

/// Full SHA-256 digest of `data`, hex-encoded.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short content fingerprint used for prompt/response correlation.
///
/// 16 hex characters (64 bits) is enough to correlate events without making
/// the stored value useful for content reconstruction.
pub fn fingerprint(data: &str) -> String {
    let mut digest = sha256_hex(data);
    digest.truncate(16);
    digest
}

/// Stable hash identifying a principal in events and audit records.
pub fn principal_hash(subject: &str) -> String {
    fingerprint(subject)
}
