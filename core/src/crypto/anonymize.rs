//! # Log Anonymisation
//!
//! Log lines carry DIDs constantly, and log aggregators outlive any
//! retention policy we set. Every DID that reaches a log line goes
//! through a keyed BLAKE3 digest first: stable within a deployment (so
//! operators can still correlate events for one user) and useless without
//! the key.
//!
//! This is operational hygiene, not a cryptographic privacy guarantee.

/// Holds the deployment's anonymisation key and salt; handed to anything
/// that wants to mention a DID in a log line.
#[derive(Clone)]
pub struct LogAnonymizer {
    key: [u8; 32],
    salt: String,
}

impl LogAnonymizer {
    pub fn new(key: [u8; 32], salt: impl Into<String>) -> Self {
        Self {
            key,
            salt: salt.into(),
        }
    }

    /// The loggable digest of a DID.
    pub fn digest(&self, did: &str) -> String {
        log_safe_did(&self.key, &self.salt, did)
    }
}

impl std::fmt::Debug for LogAnonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LogAnonymizer(..)")
    }
}

/// Digest a DID for logging: 16 hex chars of keyed BLAKE3 over salt ‖ did.
///
/// The salt separates deployments that accidentally share a key; the key
/// comes from the environment and never appears in logs itself.
pub fn log_safe_did(key: &[u8; 32], salt: &str, did: &str) -> String {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(salt.as_bytes());
    hasher.update(did.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn stable_for_same_inputs() {
        let a = log_safe_did(&KEY, "prod", "did:plc:alice");
        let b = log_safe_did(&KEY, "prod", "did:plc:alice");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn key_salt_and_did_all_separate() {
        let base = log_safe_did(&KEY, "prod", "did:plc:alice");
        assert_ne!(base, log_safe_did(&[8u8; 32], "prod", "did:plc:alice"));
        assert_ne!(base, log_safe_did(&KEY, "staging", "did:plc:alice"));
        assert_ne!(base, log_safe_did(&KEY, "prod", "did:plc:bob"));
    }

    #[test]
    fn output_never_contains_the_did() {
        let out = log_safe_did(&KEY, "prod", "did:plc:alice");
        assert!(!out.contains("alice"));
        assert!(!out.contains("did:"));
    }
}
