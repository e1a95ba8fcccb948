//! # DEK Encryption, Decryption, and Recryption
//!
//! The three-party heart of the system. `recrypt` takes an encrypted DEK
//! addressed to the author, the author's private key, and a new
//! recipient's public key, and emits the same DEK re-addressed to the
//! recipient. The plaintext DEK exists only inside that call, in a
//! [`Zeroizing`] buffer.
//!
//! Per envelope:
//!
//! 1. decapsulate the KEM ciphertext with the private key,
//! 2. HKDF the shared secret (with the envelope salt) into AES + HMAC keys,
//! 3. verify HMAC-SHA256 over `kem_ciphertext ‖ iv` before touching AES,
//! 4. AES-256-GCM decrypt the payload.
//!
//! Encryption runs the same pipeline in reverse with fresh salt, fresh
//! randomness, and a fresh encapsulation. Nothing here logs, and nothing
//! here does I/O.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{ENVELOPE_IV_LENGTH, ENVELOPE_SALT_LENGTH};
use crate::crypto::envelope::{self, Envelope, EnvelopeError};
use crate::crypto::kdf::{derive_envelope_keys, DerivedKeys};
use crate::crypto::kem::{self, KemError, KemPrivateKey, KemPublicKey};

type HmacSha256 = Hmac<Sha256>;

/// Errors from the recryption kernel.
///
/// `AuthFailure` deliberately covers both a bad HMAC and a failed GCM tag.
/// Telling an attacker which integrity layer caught them is a courtesy
/// they haven't earned.
#[derive(Debug, Error)]
pub enum RecryptError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Kem(#[from] KemError),

    /// Integrity verification failed: tampered envelope or wrong key.
    #[error("envelope authentication failed")]
    AuthFailure,
}

/// Encrypt a raw DEK to a recipient's public key. Returns the base64url
/// wire envelope.
pub fn encrypt_dek(dek: &[u8], recipient_public: &KemPublicKey) -> String {
    let mut salt = [0u8; ENVELOPE_SALT_LENGTH];
    let mut iv = [0u8; ENVELOPE_IV_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let (kem_ciphertext, shared) = kem::encapsulate(recipient_public);
    let keys = derive_envelope_keys(shared.as_bytes(), &salt);

    let cipher = Aes256Gcm::new_from_slice(&keys.aes_key)
        .expect("AES-256 key length is fixed by the KDF");
    let aes_ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), dek)
        .expect("AES-GCM encryption of an in-memory buffer cannot fail");

    let tag = envelope_mac(&keys, &kem_ciphertext, &iv);
    let bytes = envelope::assemble(&salt, &kem_ciphertext, &iv, &tag, &aes_ciphertext);
    envelope::encode_wire(&bytes)
}

/// Decrypt a wire envelope with the recipient's private key, yielding the
/// raw DEK in a zeroizing buffer.
pub fn decrypt_dek(
    wire: &str,
    private_key: &KemPrivateKey,
) -> Result<Zeroizing<Vec<u8>>, RecryptError> {
    let bytes = envelope::decode_wire(wire)?;
    let env = Envelope::parse(&bytes)?;

    let shared = kem::decapsulate(private_key, env.kem_ciphertext)?;
    let keys = derive_envelope_keys(shared.as_bytes(), env.salt);

    // HMAC first. A forged KEM ciphertext or IV must die here, before any
    // AES state is built from attacker-influenced keys.
    verify_envelope_mac(&keys, env.kem_ciphertext, env.iv, env.hmac)?;

    let cipher = Aes256Gcm::new_from_slice(&keys.aes_key)
        .expect("AES-256 key length is fixed by the KDF");
    let dek = cipher
        .decrypt(Nonce::from_slice(env.iv), env.aes_ciphertext)
        .map_err(|_| RecryptError::AuthFailure)?;
    Ok(Zeroizing::new(dek))
}

/// Re-address an encrypted DEK from the author to a new recipient.
///
/// Pure function: decrypt with the author's private key, re-encrypt to
/// the recipient's public key with entirely fresh salt, encapsulation,
/// and IV. The plaintext DEK never escapes this scope.
pub fn recrypt(
    encrypted_dek: &str,
    author_private: &KemPrivateKey,
    recipient_public: &KemPublicKey,
) -> Result<String, RecryptError> {
    let dek = decrypt_dek(encrypted_dek, author_private)?;
    Ok(encrypt_dek(&dek, recipient_public))
}

fn envelope_mac(keys: &DerivedKeys, kem_ciphertext: &[u8], iv: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.hmac_key)
        .expect("HMAC accepts any key length");
    mac.update(kem_ciphertext);
    mac.update(iv);
    mac.finalize().into_bytes().to_vec()
}

fn verify_envelope_mac(
    keys: &DerivedKeys,
    kem_ciphertext: &[u8],
    iv: &[u8],
    tag: &[u8],
) -> Result<(), RecryptError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.hmac_key)
        .expect("HMAC accepts any key length");
    mac.update(kem_ciphertext);
    mac.update(iv);
    // Constant-time comparison inside verify_slice.
    mac.verify_slice(tag).map_err(|_| RecryptError::AuthFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENVELOPE_HEADER_LENGTH;
    use crate::crypto::kem::KemKeyPair;

    fn sample_dek() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let pair = KemKeyPair::generate();
        let wire = encrypt_dek(&sample_dek(), &pair.public);
        let dek = decrypt_dek(&wire, &pair.private).unwrap();
        assert_eq!(&dek[..], &sample_dek()[..]);
    }

    #[test]
    fn recrypt_preserves_plaintext_across_keypairs() {
        let alice = KemKeyPair::generate();
        let bob = KemKeyPair::generate();

        let for_alice = encrypt_dek(&sample_dek(), &alice.public);
        let for_bob = recrypt(&for_alice, &alice.private, &bob.public).unwrap();

        let dek = decrypt_dek(&for_bob, &bob.private).unwrap();
        assert_eq!(&dek[..], &sample_dek()[..]);

        // Alice's copy still decrypts too; recryption copies, never moves.
        let dek = decrypt_dek(&for_alice, &alice.private).unwrap();
        assert_eq!(&dek[..], &sample_dek()[..]);
    }

    #[test]
    fn recrypt_emits_fresh_envelope_material() {
        let alice = KemKeyPair::generate();
        let bob = KemKeyPair::generate();
        let for_alice = encrypt_dek(&sample_dek(), &alice.public);
        let for_bob = recrypt(&for_alice, &alice.private, &bob.public).unwrap();

        let a = envelope::decode_wire(&for_alice).unwrap();
        let b = envelope::decode_wire(&for_bob).unwrap();
        let ea = Envelope::parse(&a).unwrap();
        let eb = Envelope::parse(&b).unwrap();
        assert_ne!(ea.salt, eb.salt);
        assert_ne!(ea.iv, eb.iv);
        assert_ne!(ea.kem_ciphertext, eb.kem_ciphertext);
    }

    #[test]
    fn wrong_private_key_fails_auth() {
        let alice = KemKeyPair::generate();
        let mallory = KemKeyPair::generate();
        let wire = encrypt_dek(&sample_dek(), &alice.public);
        assert!(matches!(
            decrypt_dek(&wire, &mallory.private),
            Err(RecryptError::AuthFailure)
        ));
    }

    #[test]
    fn tampered_hmac_fails_auth() {
        let pair = KemKeyPair::generate();
        let wire = encrypt_dek(&sample_dek(), &pair.public);
        let mut bytes = envelope::decode_wire(&wire).unwrap();
        // Flip one bit inside the HMAC field.
        let hmac_offset = ENVELOPE_HEADER_LENGTH - 1;
        bytes[hmac_offset] ^= 0x01;
        let tampered = envelope::encode_wire(&bytes);
        assert!(matches!(
            decrypt_dek(&tampered, &pair.private),
            Err(RecryptError::AuthFailure)
        ));
    }

    #[test]
    fn tampered_kem_ciphertext_fails_auth() {
        let pair = KemKeyPair::generate();
        let wire = encrypt_dek(&sample_dek(), &pair.public);
        let mut bytes = envelope::decode_wire(&wire).unwrap();
        // Byte 40 sits inside the KEM ciphertext field (which starts at
        // offset 38, after the 6-byte magic and 32-byte salt).
        bytes[40] ^= 0xFF;
        let tampered = envelope::encode_wire(&bytes);
        assert!(matches!(
            decrypt_dek(&tampered, &pair.private),
            Err(RecryptError::AuthFailure)
        ));
    }

    #[test]
    fn tampered_payload_fails_auth() {
        let pair = KemKeyPair::generate();
        let wire = encrypt_dek(&sample_dek(), &pair.public);
        let mut bytes = envelope::decode_wire(&wire).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = envelope::encode_wire(&bytes);
        assert!(matches!(
            decrypt_dek(&tampered, &pair.private),
            Err(RecryptError::AuthFailure)
        ));
    }

    #[test]
    fn non_envelope_input_is_rejected_structurally() {
        let pair = KemKeyPair::generate();
        assert!(matches!(
            decrypt_dek("@@not-base64@@", &pair.private),
            Err(RecryptError::Envelope(EnvelopeError::Base64))
        ));
        let short = envelope::encode_wire(b"KEMv1|way too short");
        assert!(matches!(
            decrypt_dek(&short, &pair.private),
            Err(RecryptError::Envelope(EnvelopeError::Truncated(_)))
        ));
    }
}
