//! # Field Cipher (AES-256-GCM)
//!
//! Symmetric sealing for sensitive job-payload fields: private keys and
//! bearer tokens must be ciphertext at rest in the queue and plaintext
//! only in the memory of the handler that consumes them.
//!
//! Wire format is `nonce ‖ ciphertext` in a single buffer: the first 12
//! bytes are a random 96-bit nonce, the rest is the ciphertext with the
//! 16-byte GCM tag appended by AES-GCM internally. Callers never manage
//! nonces.
//!
//! GCM is unforgiving about nonce reuse, so nonces are always drawn from
//! the OS CSPRNG. The birthday bound at 96 bits is ~2^48 messages per
//! key, far beyond any plausible queue volume.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

/// Errors from field sealing and opening.
///
/// Intentionally vague. The difference between "wrong key" and "corrupted
/// ciphertext" is none of the caller's business.
#[derive(Debug, Error)]
pub enum FieldCipherError {
    #[error("field encryption failed")]
    SealFailed,

    #[error("field decryption failed")]
    OpenFailed,

    #[error("ciphertext too short: must be at least {AES_NONCE_LENGTH} bytes")]
    CiphertextTooShort,
}

/// Seal a plaintext field under the process-wide queue key.
///
/// Returns `nonce ‖ ciphertext`.
pub fn seal(key: &[u8; AES_KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, FieldCipherError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| FieldCipherError::SealFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| FieldCipherError::SealFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a field previously sealed with [`seal`].
pub fn open(key: &[u8; AES_KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>, FieldCipherError> {
    if data.len() < AES_NONCE_LENGTH {
        return Err(FieldCipherError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| FieldCipherError::OpenFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| FieldCipherError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; AES_KEY_LENGTH] = [0x42; AES_KEY_LENGTH];

    #[test]
    fn seal_open_roundtrip() {
        let sealed = seal(&KEY, b"a very private key").unwrap();
        let opened = open(&KEY, &sealed).unwrap();
        assert_eq!(opened, b"a very private key");
    }

    #[test]
    fn nonces_never_repeat_across_calls() {
        let a = seal(&KEY, b"same plaintext").unwrap();
        let b = seal(&KEY, b"same plaintext").unwrap();
        assert_ne!(a[..AES_NONCE_LENGTH], b[..AES_NONCE_LENGTH]);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&KEY, b"secret").unwrap();
        let other = [0x43u8; AES_KEY_LENGTH];
        assert!(matches!(
            open(&other, &sealed),
            Err(FieldCipherError::OpenFailed)
        ));
    }

    #[test]
    fn bitflip_fails() {
        let mut sealed = seal(&KEY, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            open(&KEY, &sealed),
            Err(FieldCipherError::OpenFailed)
        ));
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(matches!(
            open(&KEY, &[0u8; 4]),
            Err(FieldCipherError::CiphertextTooShort)
        ));
    }
}
