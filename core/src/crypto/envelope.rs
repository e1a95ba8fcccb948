//! # The `KEMv1|` Envelope
//!
//! Wire and storage format for an encrypted DEK. One base64url string,
//! decoding to:
//!
//! ```text
//! "KEMv1|" ‖ salt[32] ‖ kem_ciphertext[1088] ‖ iv[12] ‖ hmac[32] ‖ aes_ciphertext[..]
//! ```
//!
//! The format is strict by policy: wrong magic, short fields, or trailing
//! garbage in a fixed-width field are all fatal parse errors, not warnings.
//! Ciphertexts written today must still decode in ten years, which means
//! no "lenient mode" may ever exist for readers to start depending on.
//!
//! Parsing stops at structure. HMAC verification needs derived keys and
//! lives in [`crate::crypto::dek`]; this module never touches key material.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

use crate::config::{
    ENVELOPE_HEADER_LENGTH, ENVELOPE_HMAC_LENGTH, ENVELOPE_IV_LENGTH, ENVELOPE_MAGIC,
    ENVELOPE_SALT_LENGTH, KEM_CIPHERTEXT_LENGTH,
};

/// Errors from envelope encoding and decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Not valid base64url.
    #[error("envelope is not valid base64url")]
    Base64,

    /// Missing or wrong version magic. Unknown versions are fatal; there
    /// is exactly one version until there are two.
    #[error("envelope version header missing or unknown")]
    BadMagic,

    /// The byte string is shorter than the fixed header.
    #[error("envelope truncated: {0} bytes, need at least {ENVELOPE_HEADER_LENGTH}")]
    Truncated(usize),

    /// The AES-GCM ciphertext segment is empty. A DEK payload is never
    /// zero-length (GCM emits at least its 16-byte tag).
    #[error("envelope has empty payload")]
    EmptyPayload,
}

/// A structurally valid envelope, fields borrowed from the decoded buffer.
#[derive(Debug)]
pub struct Envelope<'a> {
    pub salt: &'a [u8],
    pub kem_ciphertext: &'a [u8],
    pub iv: &'a [u8],
    pub hmac: &'a [u8],
    pub aes_ciphertext: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Split a decoded byte buffer into envelope fields, verifying magic
    /// and exact field offsets.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < ENVELOPE_HEADER_LENGTH {
            return Err(EnvelopeError::Truncated(bytes.len()));
        }
        let (magic, rest) = bytes.split_at(ENVELOPE_MAGIC.len());
        if magic != ENVELOPE_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        let (salt, rest) = rest.split_at(ENVELOPE_SALT_LENGTH);
        let (kem_ciphertext, rest) = rest.split_at(KEM_CIPHERTEXT_LENGTH);
        let (iv, rest) = rest.split_at(ENVELOPE_IV_LENGTH);
        let (hmac, aes_ciphertext) = rest.split_at(ENVELOPE_HMAC_LENGTH);
        if aes_ciphertext.is_empty() {
            return Err(EnvelopeError::EmptyPayload);
        }
        Ok(Self {
            salt,
            kem_ciphertext,
            iv,
            hmac,
            aes_ciphertext,
        })
    }
}

/// Assemble envelope fields into the canonical byte layout.
///
/// Field lengths are asserted, not trusted: every caller is inside this
/// crate and hands over freshly generated fixed-size material, so a
/// mismatch is a programming error and panics in debug and release alike.
pub fn assemble(
    salt: &[u8],
    kem_ciphertext: &[u8],
    iv: &[u8],
    hmac: &[u8],
    aes_ciphertext: &[u8],
) -> Vec<u8> {
    assert_eq!(salt.len(), ENVELOPE_SALT_LENGTH, "envelope salt length");
    assert_eq!(
        kem_ciphertext.len(),
        KEM_CIPHERTEXT_LENGTH,
        "envelope kem ciphertext length"
    );
    assert_eq!(iv.len(), ENVELOPE_IV_LENGTH, "envelope iv length");
    assert_eq!(hmac.len(), ENVELOPE_HMAC_LENGTH, "envelope hmac length");

    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LENGTH + aes_ciphertext.len());
    out.extend_from_slice(ENVELOPE_MAGIC);
    out.extend_from_slice(salt);
    out.extend_from_slice(kem_ciphertext);
    out.extend_from_slice(iv);
    out.extend_from_slice(hmac);
    out.extend_from_slice(aes_ciphertext);
    out
}

/// Decode the wire form (base64url, no padding) into raw envelope bytes.
pub fn decode_wire(s: &str) -> Result<Vec<u8>, EnvelopeError> {
    URL_SAFE_NO_PAD.decode(s).map_err(|_| EnvelopeError::Base64)
}

/// Encode raw envelope bytes into the wire form.
pub fn encode_wire(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        assemble(
            &[1u8; ENVELOPE_SALT_LENGTH],
            &[2u8; KEM_CIPHERTEXT_LENGTH],
            &[3u8; ENVELOPE_IV_LENGTH],
            &[4u8; ENVELOPE_HMAC_LENGTH],
            &[5u8; 48],
        )
    }

    #[test]
    fn parse_recovers_fields_at_exact_offsets() {
        let bytes = sample_bytes();
        let env = Envelope::parse(&bytes).unwrap();
        assert!(env.salt.iter().all(|&b| b == 1));
        assert!(env.kem_ciphertext.iter().all(|&b| b == 2));
        assert!(env.iv.iter().all(|&b| b == 3));
        assert!(env.hmac.iter().all(|&b| b == 4));
        assert_eq!(env.aes_ciphertext.len(), 48);
    }

    #[test]
    fn wire_roundtrip() {
        let bytes = sample_bytes();
        let wire = encode_wire(&bytes);
        // base64url alphabet only, no padding.
        assert!(!wire.contains('='));
        assert!(!wire.contains('+'));
        assert!(!wire.contains('/'));
        assert_eq!(decode_wire(&wire).unwrap(), bytes);
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let mut bytes = sample_bytes();
        bytes[0] = b'X';
        assert_eq!(Envelope::parse(&bytes).unwrap_err(), EnvelopeError::BadMagic);

        // A different version tag is just as dead.
        let mut v2 = sample_bytes();
        v2[..6].copy_from_slice(b"KEMv2|");
        assert_eq!(Envelope::parse(&v2).unwrap_err(), EnvelopeError::BadMagic);
    }

    #[test]
    fn truncation_is_fatal() {
        let bytes = sample_bytes();
        for cut in [0, 5, 6, 100, ENVELOPE_HEADER_LENGTH - 1] {
            let err = Envelope::parse(&bytes[..cut]).unwrap_err();
            assert_eq!(err, EnvelopeError::Truncated(cut));
        }
    }

    #[test]
    fn header_only_envelope_is_rejected() {
        let bytes = sample_bytes();
        let err = Envelope::parse(&bytes[..ENVELOPE_HEADER_LENGTH]).unwrap_err();
        assert_eq!(err, EnvelopeError::EmptyPayload);
    }

    #[test]
    fn garbage_base64_is_rejected() {
        assert_eq!(decode_wire("not!!valid").unwrap_err(), EnvelopeError::Base64);
    }
}
