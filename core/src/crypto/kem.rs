//! # ML-KEM-768 Wrapper
//!
//! Thin, typed wrappers around the libcrux ML-KEM implementation. The raw
//! library wants fixed-size arrays and hand-fed randomness; the rest of
//! this crate wants owned key types that zeroize on drop and fail loudly
//! on length mismatches, because key material reaches us as untyped byte
//! strings from the database and the wire.
//!
//! Key sizes are fixed by the parameter set: 1184-byte public keys,
//! 2400-byte private keys, 1088-byte ciphertexts, 32-byte shared secrets.

use libcrux_ml_kem::{mlkem768, MlKemCiphertext, MlKemPrivateKey, MlKemPublicKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{
    KEM_CIPHERTEXT_LENGTH, KEM_ENCAPS_RANDOMNESS_LENGTH, KEM_KEYGEN_RANDOMNESS_LENGTH,
    KEM_PRIVATE_KEY_LENGTH, KEM_PUBLIC_KEY_LENGTH, KEM_SHARED_SECRET_LENGTH,
};

/// Errors from KEM material handling.
///
/// Kept vague on purpose. Which byte was wrong is none of the caller's
/// business; lengths are the only thing we name.
#[derive(Debug, Error)]
pub enum KemError {
    #[error("invalid public key length: expected {KEM_PUBLIC_KEY_LENGTH}, got {0}")]
    InvalidPublicKeyLength(usize),

    #[error("invalid private key length: expected {KEM_PRIVATE_KEY_LENGTH}, got {0}")]
    InvalidPrivateKeyLength(usize),

    #[error("invalid ciphertext length: expected {KEM_CIPHERTEXT_LENGTH}, got {0}")]
    InvalidCiphertextLength(usize),
}

/// An ML-KEM-768 public (encapsulation) key.
#[derive(Clone, PartialEq, Eq)]
pub struct KemPublicKey(Box<[u8; KEM_PUBLIC_KEY_LENGTH]>);

impl KemPublicKey {
    /// Wrap raw public key bytes, validating the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KemError> {
        let arr: [u8; KEM_PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KemError::InvalidPublicKeyLength(bytes.len()))?;
        Ok(Self(Box::new(arr)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for KemPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Public, but 1184 bytes of hex helps nobody.
        write!(f, "KemPublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

/// An ML-KEM-768 private (decapsulation) key. Zeroized on drop.
#[derive(Clone)]
pub struct KemPrivateKey(Box<[u8; KEM_PRIVATE_KEY_LENGTH]>);

impl Zeroize for KemPrivateKey {
    fn zeroize(&mut self) {
        self.0.as_mut().zeroize();
    }
}

impl Drop for KemPrivateKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for KemPrivateKey {}

impl KemPrivateKey {
    /// Wrap raw private key bytes, validating the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KemError> {
        let arr: [u8; KEM_PRIVATE_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KemError::InvalidPrivateKeyLength(bytes.len()))?;
        Ok(Self(Box::new(arr)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for KemPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KemPrivateKey(..)")
    }
}

/// A freshly generated keypair.
pub struct KemKeyPair {
    pub public: KemPublicKey,
    pub private: KemPrivateKey,
}

impl KemKeyPair {
    /// Generate a new ML-KEM-768 keypair from OS randomness.
    pub fn generate() -> Self {
        let mut randomness = [0u8; KEM_KEYGEN_RANDOMNESS_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut randomness);
        let pair = mlkem768::generate_key_pair(randomness);
        let (sk, pk) = pair.into_parts();
        randomness.zeroize();
        Self {
            public: KemPublicKey(Box::new(*pk.as_slice())),
            private: KemPrivateKey(Box::new(*sk.as_slice())),
        }
    }
}

/// A shared secret produced by encapsulation or decapsulation.
/// Zeroized on drop; lives only inside the recryption kernel.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; KEM_SHARED_SECRET_LENGTH]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encapsulate to a public key: fresh shared secret plus the 1088-byte
/// ciphertext that transports it.
pub fn encapsulate(public_key: &KemPublicKey) -> (Vec<u8>, SharedSecret) {
    let mut randomness = [0u8; KEM_ENCAPS_RANDOMNESS_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut randomness);
    let pk = MlKemPublicKey::<KEM_PUBLIC_KEY_LENGTH>::from(*public_key.0);
    let (ct, ss) = mlkem768::encapsulate(&pk, randomness);
    randomness.zeroize();
    (ct.as_slice().to_vec(), SharedSecret(ss))
}

/// Decapsulate a ciphertext with a private key, recovering the shared
/// secret. ML-KEM decapsulation cannot fail observably — a corrupted
/// ciphertext yields a garbage secret, and the envelope HMAC catches it.
pub fn decapsulate(
    private_key: &KemPrivateKey,
    ciphertext: &[u8],
) -> Result<SharedSecret, KemError> {
    let ct_arr: [u8; KEM_CIPHERTEXT_LENGTH] = ciphertext
        .try_into()
        .map_err(|_| KemError::InvalidCiphertextLength(ciphertext.len()))?;
    let sk = MlKemPrivateKey::<KEM_PRIVATE_KEY_LENGTH>::from(*private_key.0);
    let ct = MlKemCiphertext::<KEM_CIPHERTEXT_LENGTH>::from(ct_arr);
    let ss = mlkem768::decapsulate(&sk, &ct);
    Ok(SharedSecret(ss))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_recovers_shared_secret() {
        let pair = KemKeyPair::generate();
        let (ct, ss1) = encapsulate(&pair.public);
        let ss2 = decapsulate(&pair.private, &ct).unwrap();
        assert_eq!(ss1.as_bytes(), ss2.as_bytes());
    }

    #[test]
    fn sizes_are_exact() {
        let pair = KemKeyPair::generate();
        assert_eq!(pair.public.as_bytes().len(), KEM_PUBLIC_KEY_LENGTH);
        assert_eq!(pair.private.as_bytes().len(), KEM_PRIVATE_KEY_LENGTH);
        let (ct, ss) = encapsulate(&pair.public);
        assert_eq!(ct.len(), KEM_CIPHERTEXT_LENGTH);
        assert_eq!(ss.as_bytes().len(), KEM_SHARED_SECRET_LENGTH);
    }

    #[test]
    fn wrong_lengths_are_rejected() {
        assert!(KemPublicKey::from_bytes(&[0u8; 100]).is_err());
        assert!(KemPrivateKey::from_bytes(&[0u8; 100]).is_err());
        let pair = KemKeyPair::generate();
        assert!(decapsulate(&pair.private, &[0u8; 10]).is_err());
    }

    #[test]
    fn distinct_keypairs_produce_distinct_secrets() {
        let a = KemKeyPair::generate();
        let b = KemKeyPair::generate();
        assert_ne!(a.public.as_bytes(), b.public.as_bytes());
        let (ct, ss_a) = encapsulate(&a.public);
        // Decapsulating A's ciphertext with B's key yields an (implicitly
        // rejected) garbage secret, not an error.
        let ss_b = decapsulate(&b.private, &ct).unwrap();
        assert_ne!(ss_a.as_bytes(), ss_b.as_bytes());
    }

    #[test]
    fn byte_roundtrip_preserves_keys() {
        let pair = KemKeyPair::generate();
        let pk = KemPublicKey::from_bytes(pair.public.as_bytes()).unwrap();
        let sk = KemPrivateKey::from_bytes(pair.private.as_bytes()).unwrap();
        let (ct, ss1) = encapsulate(&pk);
        let ss2 = decapsulate(&sk, &ct).unwrap();
        assert_eq!(ss1.as_bytes(), ss2.as_bytes());
    }
}
