//! # Cryptographic Kernel
//!
//! Everything key-shaped in the control plane flows through this module.
//! It is deliberately pure: no I/O, no database handles, no async. The
//! propagation engine feeds it bytes and gets bytes back.
//!
//! We deliberately chose boring, audited cryptography:
//!
//! - **ML-KEM-768** for key encapsulation — the NIST post-quantum pick,
//!   via the formally verified libcrux implementation.
//! - **HKDF-SHA256** to split one shared secret into independent AES and
//!   HMAC keys.
//! - **AES-256-GCM** for the DEK payload and for queue field encryption.
//! - **HMAC-SHA256** over the KEM ciphertext and IV, so envelope tampering
//!   dies before AES-GCM ever runs.
//! - **BLAKE3** (keyed) for log anonymisation — not a secrecy boundary,
//!   just keeps raw DIDs out of log aggregators.
//!
//! ## A note on "rolling your own crypto"
//!
//! We don't. The one construction we own is the envelope layout in
//! [`envelope`], and that is composition, not invention. If you're tempted
//! to optimize these functions, go read about nonce reuse and come back
//! when you've lost the urge.

pub mod anonymize;
pub mod dek;
pub mod encryption;
pub mod envelope;
pub mod kdf;
pub mod kem;

pub use dek::{decrypt_dek, encrypt_dek, recrypt, RecryptError};
pub use envelope::{Envelope, EnvelopeError};
pub use kem::{KemKeyPair, KemPrivateKey, KemPublicKey};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// base64url (no padding), the encoding for all key material and
/// envelopes on the wire and in job payloads.
pub fn to_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Inverse of [`to_base64url`].
pub fn from_base64url(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}
