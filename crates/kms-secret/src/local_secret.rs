use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use kms_core::secret::{BaseSecret, Mode, SecretStatus};
use tracing::instrument;
use zeroize::Zeroizing;

use crate::{
    error::{Result, SecretError},
    kdf::derive_key,
    keeper::{random_key, LocalKeeper},
};

/// Secret sealed with a per-secret random key, optionally strengthened by a
/// master key supplied by the host.
///
/// Both operations are all-or-nothing: the wrapped secret only changes when
/// the operation succeeds.
pub struct LocalSecret {
    secret: BaseSecret,
    master_key: Zeroizing<String>,
}

impl LocalSecret {
    pub fn new(secret: BaseSecret, master_key: impl Into<String>) -> Self {
        Self {
            secret,
            master_key: Zeroizing::new(master_key.into()),
        }
    }

    pub fn status(&self) -> SecretStatus {
        self.secret.status
    }

    pub fn payload(&self) -> &str {
        &self.secret.payload
    }

    pub fn key(&self) -> &str {
        &self.secret.key
    }

    pub fn mode(&self) -> Mode {
        self.secret.mode
    }

    pub fn into_inner(self) -> BaseSecret {
        self.secret
    }

    /// Seal the plain payload.
    #[instrument(skip_all, fields(additional_data = %self.secret.additional_data))]
    pub fn encrypt(&mut self) -> Result<()> {
        if self.secret.status != SecretStatus::Plain {
            return Err(SecretError::WrongStatus);
        }
        if self.secret.payload.is_empty() {
            return Err(SecretError::InvalidSecret("empty payload".into()));
        }

        let secret_key = random_key();
        let mode = Mode::for_master_key(&self.master_key);
        let key = derive_key(
            &secret_key[..],
            &self.master_key,
            &self.secret.additional_data,
            mode,
        )?;
        let ciphertext = LocalKeeper::new(&key).encrypt(self.secret.payload.as_bytes())?;

        self.secret.key = hex::encode(&secret_key[..]);
        self.secret.payload = STANDARD.encode(ciphertext);
        self.secret.status = SecretStatus::SecretBox;
        self.secret.mode = mode;
        Ok(())
    }

    /// Open a sealed payload. Envelopes in `Mode::Local` are opened with the
    /// local derivation even when a master key is configured now.
    #[instrument(skip_all, fields(additional_data = %self.secret.additional_data, mode = ?self.secret.mode))]
    pub fn decrypt(&mut self) -> Result<()> {
        if self.secret.status != SecretStatus::SecretBox {
            return Err(SecretError::WrongStatus);
        }
        let encrypted = STANDARD
            .decode(&self.secret.payload)
            .map_err(|e| SecretError::InvalidSecret(format!("payload is not base64: {e}")))?;
        let secret_key = Zeroizing::new(
            hex::decode(&self.secret.key)
                .map_err(|e| SecretError::InvalidSecret(format!("key is not hex: {e}")))?,
        );

        let key = derive_key(
            &secret_key,
            &self.master_key,
            &self.secret.additional_data,
            self.secret.mode,
        )?;
        let plaintext = LocalKeeper::new(&key).decrypt(&encrypted)?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| SecretError::InvalidSecret("payload is not valid UTF-8".into()))?;

        self.secret = BaseSecret {
            status: SecretStatus::Plain,
            payload: plaintext,
            ..BaseSecret::default()
        };
        Ok(())
    }
}

impl fmt::Debug for LocalSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSecret")
            .field("secret", &self.secret)
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}
