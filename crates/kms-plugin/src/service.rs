use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use kms_core::{
    driver::ScopedDriver,
    secret::{BaseSecret, Mode},
};
use kms_secret::LocalSecret;
use serde::Serialize;
use tracing::{instrument, warn, Span};

use crate::{
    error::{KmsError, Operation},
    registry::{loggable_url, DriverRegistry},
};

/// Deadline covering driver construction plus the remote call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of [`KmsService::encrypt`], stored by the host next to the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedPayload {
    /// Standard base64 of the backend ciphertext.
    pub ciphertext: String,
    /// Hex per-secret key; empty when no master key was configured.
    pub key: String,
    pub mode: i32,
}

/// Entry point for the host's encrypt/decrypt calls.
///
/// Each call opens its own driver and closes it before returning, whatever
/// the outcome. Nothing is cached between calls.
pub struct KmsService {
    registry: Arc<DriverRegistry>,
    timeout: Duration,
    span: Span,
}

impl KmsService {
    /// `span` is the parent of every record the service emits.
    pub fn new(registry: Arc<DriverRegistry>, span: Span) -> Self {
        Self {
            registry,
            timeout: DEFAULT_TIMEOUT,
            span,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(parent = &self.span, name = "encrypt", skip_all, fields(url = %loggable_url(url)))]
    pub async fn encrypt(
        &self,
        payload: &str,
        additional_data: &str,
        url: &str,
        master_key: &str,
    ) -> Result<EncryptedPayload, KmsError> {
        if payload.is_empty() {
            warn!("unable to encrypt: empty payload");
            return Err(KmsError::Input("empty payload".into()));
        }

        let (payload, key, mode) = if master_key.is_empty() {
            (payload.to_string(), String::new(), Mode::Local)
        } else {
            let mut secret =
                LocalSecret::new(BaseSecret::plain(payload, additional_data), master_key);
            secret.encrypt().map_err(|err| {
                warn!("unable to encrypt local secret: {err}");
                KmsError::from(err)
            })?;
            let sealed = secret.into_inner();
            (sealed.payload, sealed.key, sealed.mode)
        };

        let ciphertext = self
            .with_driver(Operation::Encrypt, url, payload.as_bytes())
            .await?;
        Ok(EncryptedPayload {
            ciphertext: STANDARD.encode(ciphertext),
            key,
            mode: mode.as_i32(),
        })
    }

    /// Inputs are validated before any driver is opened. The local tier is
    /// only involved when `key` is non-empty.
    #[instrument(parent = &self.span, name = "decrypt", skip_all, fields(url = %loggable_url(url)))]
    pub async fn decrypt(
        &self,
        ciphertext: &str,
        key: &str,
        additional_data: &str,
        mode: i32,
        url: &str,
        master_key: &str,
    ) -> Result<String, KmsError> {
        let mode = if key.is_empty() {
            None
        } else {
            if !is_hex(key) {
                warn!("unable to decode key to decrypt: not hex");
                return Err(KmsError::Input("key is not hex".into()));
            }
            Some(Mode::try_from(mode).map_err(|e| {
                warn!("invalid mode to decrypt: {e}");
                KmsError::Input(e.to_string())
            })?)
        };
        let encrypted = STANDARD.decode(ciphertext).map_err(|e| {
            warn!("unable to decode as base64 payload to decrypt: {e}");
            KmsError::Input(format!("ciphertext is not base64: {e}"))
        })?;

        let plaintext = self
            .with_driver(Operation::Decrypt, url, &encrypted)
            .await?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| KmsError::Crypto("keeper returned a non UTF-8 payload".into()))?;

        let Some(mode) = mode else {
            return Ok(plaintext);
        };
        let mut secret = LocalSecret::new(
            BaseSecret::sealed(plaintext, key, additional_data, mode),
            master_key,
        );
        secret.decrypt().map_err(|err| {
            warn!("unable to decrypt local secret: {err}");
            KmsError::from(err)
        })?;
        Ok(secret.into_inner().payload)
    }

    /// Open a driver for `url` and run `op` on it under the deadline.
    async fn with_driver(
        &self,
        op: Operation,
        url: &str,
        input: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let call = async {
            let driver = self.registry.open(url).await.map_err(|source| {
                warn!("unable to open keeper to {op}: {source}");
                KmsError::Open {
                    url: loggable_url(url),
                    source,
                }
            })?;
            let driver = ScopedDriver::new(driver);
            let output = match op {
                Operation::Encrypt => driver.encrypt(input).await,
                Operation::Decrypt => driver.decrypt(input).await,
            };
            output.map_err(|source| {
                warn!(driver = driver.name(), "unable to {op}: {source}");
                KmsError::Backend {
                    op,
                    url: loggable_url(url),
                    source,
                }
            })
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(after = ?self.timeout, "{op} timed out");
                Err(KmsError::Timeout {
                    op,
                    url: loggable_url(url),
                    after: self.timeout,
                })
            }
        }
    }
}

fn is_hex(value: &str) -> bool {
    value.len() % 2 == 0 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
