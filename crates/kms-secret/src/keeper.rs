use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use crypto_secretbox::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Key, Nonce, XSalsa20Poly1305,
};
use kms_core::driver::{Driver, DriverError, DriverOpener};
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    error::{Result, SecretError},
    kdf::KEY_LEN,
};

/// Size of the secretbox nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 24;

/// URL scheme served by [`LocalKeeperOpener`].
pub const BASE64_KEY_SCHEME: &str = "base64key";

/// Symmetric keeper sealing data with XSalsa20-Poly1305.
///
/// Output layout: `[ 24-byte nonce | 16-byte tag | ciphertext ]`, the NaCl
/// secretbox framing, so data sealed by other secretbox keepers opens here.
pub struct LocalKeeper {
    cipher: XSalsa20Poly1305,
}

impl LocalKeeper {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretError::Encryption(e.to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + sealed.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(SecretError::Decryption);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SecretError::Decryption)
    }
}

/// Fresh random 256-bit key.
pub fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut bytes[..]);
    bytes
}

/// Driver for `base64key://<key>` URLs: a static key held by the host.
pub struct LocalKeeperDriver {
    keeper: Option<LocalKeeper>,
}

impl LocalKeeperDriver {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            keeper: Some(LocalKeeper::new(key)),
        }
    }

    /// Parse a `base64key://` URL. An empty key yields a random one, valid for
    /// the lifetime of this driver only.
    pub fn from_url(url: &str) -> std::result::Result<Self, DriverError> {
        let encoded = url
            .strip_prefix("base64key://")
            .ok_or_else(|| DriverError::InvalidUrl {
                reason: "expected a base64key:// URL".into(),
            })?;
        let encoded = encoded.split('?').next().unwrap_or_default();
        if encoded.is_empty() {
            debug!("no key in base64key URL, using a random key");
            return Ok(Self::new(&random_key()));
        }
        let key = decode_key(encoded)?;
        Ok(Self::new(&key))
    }

    fn keeper(&self) -> std::result::Result<&LocalKeeper, DriverError> {
        self.keeper.as_ref().ok_or(DriverError::Closed)
    }
}

fn decode_key(encoded: &str) -> std::result::Result<Zeroizing<[u8; KEY_LEN]>, DriverError> {
    let bytes = Zeroizing::new(
        URL_SAFE
            .decode(encoded)
            .or_else(|_| STANDARD.decode(encoded))
            .map_err(|e| DriverError::InvalidUrl {
                reason: format!("key is not valid base64: {e}"),
            })?,
    );
    if bytes.len() != KEY_LEN {
        return Err(DriverError::InvalidUrl {
            reason: format!("expected {KEY_LEN} key bytes, got {}", bytes.len()),
        });
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[async_trait]
impl Driver for LocalKeeperDriver {
    fn name(&self) -> &'static str {
        BASE64_KEY_SCHEME
    }

    async fn encrypt(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, DriverError> {
        self.keeper()?
            .encrypt(plaintext)
            .map_err(|e| DriverError::Operation {
                op: "encrypt",
                reason: e.to_string(),
            })
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> std::result::Result<Vec<u8>, DriverError> {
        self.keeper()?
            .decrypt(ciphertext)
            .map_err(|e| DriverError::Operation {
                op: "decrypt",
                reason: e.to_string(),
            })
    }

    fn close(&mut self) -> std::result::Result<(), DriverError> {
        self.keeper = None;
        Ok(())
    }
}

/// Opener for the `base64key` scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalKeeperOpener;

#[async_trait]
impl DriverOpener for LocalKeeperOpener {
    async fn open(&self, url: &str) -> std::result::Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(LocalKeeperDriver::from_url(url)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeper_round_trips_and_prefixes_nonce() {
        let keeper = LocalKeeper::new(&[1u8; KEY_LEN]);
        let sealed = keeper.encrypt(b"hello").expect("encrypt");
        // nonce + poly1305 tag + plaintext length
        assert_eq!(sealed.len(), NONCE_LEN + 16 + 5);
        assert_eq!(keeper.decrypt(&sealed).expect("decrypt"), b"hello");
    }

    #[test]
    fn keeper_rejects_wrong_key_and_short_input() {
        let sealed = LocalKeeper::new(&[1u8; KEY_LEN])
            .encrypt(b"hello")
            .expect("encrypt");
        let other = LocalKeeper::new(&[2u8; KEY_LEN]);
        assert_eq!(other.decrypt(&sealed), Err(SecretError::Decryption));
        assert_eq!(other.decrypt(&[0u8; 3]), Err(SecretError::Decryption));
    }

    #[test]
    fn keeper_rejects_tampered_ciphertext() {
        let keeper = LocalKeeper::new(&[1u8; KEY_LEN]);
        let mut sealed = keeper.encrypt(b"hello").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(keeper.decrypt(&sealed), Err(SecretError::Decryption));
    }

    #[tokio::test]
    async fn base64key_driver_round_trips() {
        let url = format!("base64key://{}", URL_SAFE.encode([9u8; KEY_LEN]));
        let driver = LocalKeeperOpener.open(&url).await.expect("open");
        let sealed = driver.encrypt(b"secret").await.expect("encrypt");
        assert_eq!(driver.decrypt(&sealed).await.expect("decrypt"), b"secret");

        // a second driver for the same URL opens the same data
        let again = LocalKeeperOpener.open(&url).await.expect("open");
        assert_eq!(again.decrypt(&sealed).await.expect("decrypt"), b"secret");
    }

    #[tokio::test]
    async fn base64key_driver_rejects_short_key() {
        let url = format!("base64key://{}", STANDARD.encode([9u8; 8]));
        let err = LocalKeeperDriver::from_url(&url).err().expect("should fail");
        assert!(matches!(err, DriverError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn empty_base64key_uses_random_key() {
        let mut driver = LocalKeeperDriver::from_url("base64key://").expect("open");
        let sealed = driver.encrypt(b"x").await.expect("encrypt");
        assert_eq!(driver.decrypt(&sealed).await.expect("decrypt"), b"x");

        driver.close().expect("close");
        driver.close().expect("close is idempotent");
        assert!(matches!(
            driver.encrypt(b"x").await,
            Err(DriverError::Closed)
        ));
    }
}
