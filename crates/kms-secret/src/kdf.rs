//! HKDF-SHA256 derivation of the key that seals a single secret.
//!
//! The per-secret key is the HKDF salt, binding the derived key to one
//! envelope, and the additional data is the HKDF info, binding it to the
//! field it protects. The input keying material depends on the mode:
//!
//! - `Mode::MasterKey` with a non-empty master key: the master key itself.
//! - otherwise: `SHA-256(key ‖ additional_data ‖ key)`. This pseudo secret is
//!   built only from material stored next to the ciphertext and is therefore
//!   weaker than a real master key. It reproduces the derivation used before
//!   master keys existed and must stay bit-for-bit identical.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use kms_core::secret::Mode;

use crate::error::{Result, SecretError};

/// Length of the per-secret key and of the derived key (256 bits).
pub const KEY_LEN: usize = 32;

/// Derive the 32-byte sealing key for one secret.
pub fn derive_key(
    secret_key: &[u8],
    master_key: &str,
    additional_data: &str,
    mode: Mode,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let ikm: Zeroizing<Vec<u8>> = if mode == Mode::Local || master_key.is_empty() {
        Zeroizing::new(local_pseudo_secret(secret_key, additional_data).to_vec())
    } else {
        Zeroizing::new(master_key.as_bytes().to_vec())
    };

    let hk = Hkdf::<Sha256>::new(Some(secret_key), &ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(additional_data.as_bytes(), &mut okm[..])
        .map_err(|e| SecretError::Derivation(e.to_string()))?;
    Ok(okm)
}

/// `SHA-256(key ‖ additional_data ‖ key)`, the mode 0 input keying material.
pub fn local_pseudo_secret(secret_key: &[u8], additional_data: &str) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(secret_key);
    hasher.update(additional_data.as_bytes());
    hasher.update(secret_key);
    Zeroizing::new(hasher.finalize().into())
}
