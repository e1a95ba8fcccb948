//! # Key Derivation
//!
//! One KEM shared secret must feed two independent keys: AES-256 for the
//! DEK payload and HMAC-SHA256 for envelope integrity. HKDF-SHA256 does
//! the split. The info string pins the derivation to this cipher suite,
//! so a future suite bump cannot silently produce colliding keys.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{AES_KEY_LENGTH, DERIVED_KEY_LENGTH, ENVELOPE_HMAC_LENGTH, HKDF_INFO};

/// The pair of keys derived from one shared secret. Zeroized on drop;
/// never serialized, never logged.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub aes_key: [u8; AES_KEY_LENGTH],
    pub hmac_key: [u8; ENVELOPE_HMAC_LENGTH],
}

/// HKDF-SHA256(shared_secret, salt, info) expanded to 64 bytes and split
/// into (aes_key, hmac_key).
///
/// The expand length is far below the HKDF ceiling of 255 * 32 bytes, so
/// the expand cannot fail; the expect documents that.
pub fn derive_envelope_keys(shared_secret: &[u8], salt: &[u8]) -> DerivedKeys {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = [0u8; DERIVED_KEY_LENGTH];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("HKDF expand of 64 bytes cannot fail");

    let mut keys = DerivedKeys {
        aes_key: [0u8; AES_KEY_LENGTH],
        hmac_key: [0u8; ENVELOPE_HMAC_LENGTH],
    };
    keys.aes_key.copy_from_slice(&okm[..AES_KEY_LENGTH]);
    keys.hmac_key.copy_from_slice(&okm[AES_KEY_LENGTH..]);
    okm.zeroize();
    keys
}
