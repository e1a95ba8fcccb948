//! # Protocol Constants & Tunables
//!
//! Every magic number in the control plane lives here. If you're hardcoding
//! a constant somewhere else, you're doing it wrong and you owe the team
//! coffee.
//!
//! Some of these are wire-format law (the envelope field sizes — changing
//! them bricks every ciphertext already in the database), some are
//! deployment defaults that the environment may override (quotas, delays,
//! windows). The wire-format ones are grouped first so nobody "tunes" them
//! by accident.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Encrypted DEK envelope — wire-format law
// ---------------------------------------------------------------------------

/// Version magic prefixed to every encrypted DEK. An envelope that does not
/// start with exactly these bytes is rejected before any crypto runs.
pub const ENVELOPE_MAGIC: &[u8] = b"KEMv1|";

/// HKDF salt length. Fresh random salt per envelope.
pub const ENVELOPE_SALT_LENGTH: usize = 32;

/// ML-KEM-768 ciphertext length. Fixed by the KEM parameter set.
pub const KEM_CIPHERTEXT_LENGTH: usize = 1088;

/// AES-256-GCM nonce length. 96 bits is the standard and the only length
/// you should use. 12 bytes. Not 16. Not 8. Twelve.
pub const ENVELOPE_IV_LENGTH: usize = 12;

/// HMAC-SHA256 tag length covering `kem_ciphertext ‖ iv`.
pub const ENVELOPE_HMAC_LENGTH: usize = 32;

/// Byte offset of each envelope field, in order. The AES-GCM ciphertext is
/// everything after the HMAC; its length floats with the plaintext DEK.
pub const ENVELOPE_HEADER_LENGTH: usize = ENVELOPE_MAGIC.len()
    + ENVELOPE_SALT_LENGTH
    + KEM_CIPHERTEXT_LENGTH
    + ENVELOPE_IV_LENGTH
    + ENVELOPE_HMAC_LENGTH;

/// HKDF info string. Binds the derived keys to this exact suite; a future
/// suite change gets a new info string and a new envelope magic.
pub const HKDF_INFO: &[u8] = b"ML-KEM-768-AES-HMAC";

/// Bytes of key material expanded from HKDF: a 32-byte AES key followed by
/// a 32-byte HMAC key.
pub const DERIVED_KEY_LENGTH: usize = 64;

// ---------------------------------------------------------------------------
// ML-KEM-768 parameter sizes
// ---------------------------------------------------------------------------

/// ML-KEM-768 public key size in bytes.
pub const KEM_PUBLIC_KEY_LENGTH: usize = 1184;

/// ML-KEM-768 private key size in bytes.
pub const KEM_PRIVATE_KEY_LENGTH: usize = 2400;

/// ML-KEM-768 shared secret size in bytes.
pub const KEM_SHARED_SECRET_LENGTH: usize = 32;

/// Randomness consumed by key generation.
pub const KEM_KEYGEN_RANDOMNESS_LENGTH: usize = 64;

/// Randomness consumed by encapsulation.
pub const KEM_ENCAPS_RANDOMNESS_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// AES-256-GCM (field cipher and envelope payload)
// ---------------------------------------------------------------------------

/// AES-256 key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes.
pub const AES_NONCE_LENGTH: usize = 12;

// ---------------------------------------------------------------------------
// Trust graph
// ---------------------------------------------------------------------------

/// Default daily quota of new trust edges per author. Counted over a
/// sliding 24-hour window including tombstoned edges, so removing and
/// re-adding does not reset the meter.
pub const DEFAULT_TRUST_QUOTA: usize = 10;

/// The window the quota counts over.
pub const TRUST_QUOTA_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay applied to jobs spawned by bulk trust mutations. Long enough for
/// a user to notice a mis-click and undo before any fan-out work runs.
pub const DEFAULT_BULK_DELAY: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Keystore
// ---------------------------------------------------------------------------

/// Minimum age of the current keypair before a rotation is accepted.
/// Stops a buggy client from burning through keypairs in a loop.
pub const DEFAULT_ROTATE_MIN_AGE: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Session stores
// ---------------------------------------------------------------------------

/// Recency window for adding a new recipient to existing private sessions.
pub const DEFAULT_POST_SESSION_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Recency window for adding a new recipient to existing profile sessions.
/// Profiles are long-lived, so the window is a year.
pub const DEFAULT_PROFILE_SESSION_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Rows fetched per batch when migrating session keys to a new keypair.
/// Each update removes the row from the driving query, so progress is
/// monotone even if the process dies mid-batch.
pub const ROTATION_BATCH_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Default retry attempts before a job is quarantined.
pub const DEFAULT_RETRY_LIMIT: u32 = 12;

/// Base delay before the first retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Multiplier applied to the retry delay per attempt.
pub const DEFAULT_RETRY_BACKOFF: f64 = 2.0;

/// Upper bound on a single retry delay, back-off notwithstanding.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(6 * 60 * 60);

/// Default concurrent jobs per queue name per worker process.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// How often an idle worker re-scans for due jobs. Publishes on the same
/// process wake the worker immediately; this is the cross-process floor.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Identity verification
// ---------------------------------------------------------------------------

/// TTL of a verified `(did, handle)` binding in the identity cache.
/// Token revocation reconverges within this window.
pub const IDENTITY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Federation hosts trusted to mint session tokens without the subdomain
/// proof. Everyone else gets the full treatment.
pub const DEFAULT_TRUSTED_HOSTS: &[&str] = &["bsky.social", "blacksky.app", "bsky.network"];

/// Deadline for any single outbound HTTP call to a federation host or a
/// sibling service. On expiry the caller errors and the queue retries.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_header_adds_up() {
        // 6 + 32 + 1088 + 12 + 32. If this moves, every stored ciphertext
        // in production becomes unreadable.
        assert_eq!(ENVELOPE_HEADER_LENGTH, 1170);
        assert_eq!(ENVELOPE_MAGIC.len(), 6);
    }

    #[test]
    fn derived_key_splits_into_aes_and_hmac() {
        assert_eq!(DERIVED_KEY_LENGTH, AES_KEY_LENGTH + ENVELOPE_HMAC_LENGTH);
    }

    #[test]
    fn kem_sizes_match_mlkem768() {
        assert_eq!(KEM_PUBLIC_KEY_LENGTH, 1184);
        assert_eq!(KEM_PRIVATE_KEY_LENGTH, 2400);
        assert_eq!(KEM_CIPHERTEXT_LENGTH, 1088);
        assert_eq!(KEM_SHARED_SECRET_LENGTH, 32);
    }

    #[test]
    fn retry_schedule_sanity() {
        assert!(DEFAULT_RETRY_LIMIT > 0);
        assert!(DEFAULT_RETRY_BACKOFF >= 1.0);
        assert!(DEFAULT_RETRY_DELAY < MAX_RETRY_DELAY);
    }

    #[test]
    fn windows_sanity() {
        // The profile window must dominate the post window; profiles live
        // longer than posts by design of the product, not of this crate.
        assert!(DEFAULT_PROFILE_SESSION_WINDOW > DEFAULT_POST_SESSION_WINDOW);
        assert!(DEFAULT_BULK_DELAY < TRUST_QUOTA_WINDOW);
    }
}
