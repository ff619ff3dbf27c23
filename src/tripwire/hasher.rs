//! IG-014: BLAKE3 hashing for fingerprints, journal keys and submission keys.

use crate::core::types::ActionId;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple components (NUL-separated).
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// First 16 hex digits of the hash of an action id; safe as a file name.
pub fn action_digest(id: &ActionId) -> String {
    let hex = blake3::hash(id.as_str().as_bytes()).to_hex();
    hex[..16].to_string()
}

/// Engine-assigned key for one submission attempt. The same
/// `(module, action, attempt)` always yields the same key, so an adapter can
/// recognise a resubmission and report its status.
pub fn submission_key(module: &str, action: &ActionId, attempt: u32) -> String {
    let attempt = attempt.to_string();
    let digest = composite_hash(&[module, action.as_str(), &attempt]);
    format!("sub-{}", &digest["blake3:".len().."blake3:".len() + 24])
}
