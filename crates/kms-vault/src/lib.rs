//! Driver for the HashiCorp Vault transit engine (`hashivault://<key-name>`).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kms_core::driver::{Driver, DriverError, DriverOpener};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;
use url::Url;

/// URL scheme served by [`VaultOpener`].
pub const VAULT_SCHEME: &str = "hashivault";
pub const SERVER_URL_ENV: &str = "VAULT_SERVER_URL";
pub const SERVER_TOKEN_ENV: &str = "VAULT_SERVER_TOKEN";

const TOKEN_HEADER: &str = "x-vault-token";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid hashivault URL: {0}")]
    InvalidUrl(String),
    #[error("{0} is not set")]
    MissingSetting(&'static str),
    #[error("invalid Vault server address: {0}")]
    InvalidAddress(String),
    #[error("invalid Vault token")]
    InvalidToken,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("unexpected Vault response: {0}")]
    Response(String),
}

impl VaultError {
    fn into_driver_error(self, op: &'static str) -> DriverError {
        match self {
            VaultError::InvalidUrl(reason) => DriverError::InvalidUrl { reason },
            err @ (VaultError::MissingSetting(_)
            | VaultError::InvalidAddress(_)
            | VaultError::InvalidToken) => DriverError::Open {
                reason: err.to_string(),
            },
            other => DriverError::Operation {
                op,
                reason: other.to_string(),
            },
        }
    }
}

/// Server address and token, read from `VAULT_SERVER_URL` and
/// `VAULT_SERVER_TOKEN`.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultConfig {
    pub address: String,
    pub token: String,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("address", &self.address)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl VaultConfig {
    pub fn from_env() -> Result<Self, VaultError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, VaultError> {
        let read = |name: &'static str| {
            env(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(VaultError::MissingSetting(name))
        };
        Ok(Self {
            address: read(SERVER_URL_ENV)?,
            token: read(SERVER_TOKEN_ENV)?,
        })
    }
}

/// Extract the transit key name from `hashivault://<key-name>`.
pub fn key_name_from_url(url: &str) -> Result<String, VaultError> {
    let rest = url
        .strip_prefix(VAULT_SCHEME)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or_else(|| VaultError::InvalidUrl(format!("expected {VAULT_SCHEME}:// prefix")))?;
    let name = rest.split('?').next().unwrap_or_default().trim_matches('/');
    if name.is_empty() {
        return Err(VaultError::InvalidUrl("missing transit key name".into()));
    }
    Ok(name.to_string())
}

#[derive(Debug, Serialize)]
struct EncryptRequest<'a> {
    plaintext: &'a str,
}

#[derive(Debug, Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransitResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct EncryptData {
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct DecryptData {
    plaintext: String,
}

struct Transit {
    client: reqwest::Client,
    base: Url,
}

/// Driver bound to one transit key.
pub struct VaultDriver {
    key_name: String,
    transit: Option<Transit>,
}

impl VaultDriver {
    pub fn open(url: &str, config: &VaultConfig) -> Result<Self, VaultError> {
        let key_name = key_name_from_url(url)?;
        let mut base = Url::parse(&config.address)
            .map_err(|e| VaultError::InvalidAddress(format!("{}: {e}", config.address)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("sftpgo-plugin-kms"));
        let mut token =
            HeaderValue::from_str(&config.token).map_err(|_| VaultError::InvalidToken)?;
        token.set_sensitive(true);
        headers.insert(TOKEN_HEADER, token);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            key_name,
            transit: Some(Transit { client, base }),
        })
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    fn transit(&self) -> Result<&Transit, DriverError> {
        self.transit.as_ref().ok_or(DriverError::Closed)
    }

    fn endpoint(base: &Url, op: &str, key_name: &str) -> Result<Url, VaultError> {
        base.join(&format!("v1/transit/{op}/{key_name}"))
            .map_err(|e| VaultError::InvalidUrl(e.to_string()))
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        transit: &Transit,
        op: &str,
        body: &B,
    ) -> Result<T, VaultError> {
        let url = Self::endpoint(&transit.base, op, &self.key_name)?;
        let resp: TransitResponse<T> = transit
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.data)
    }
}

#[async_trait]
impl Driver for VaultDriver {
    fn name(&self) -> &'static str {
        VAULT_SCHEME
    }

    #[instrument(skip_all, fields(key = %self.key_name))]
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, DriverError> {
        let transit = self.transit()?;
        let encoded = BASE64.encode(plaintext);
        let data: EncryptData = self
            .post(transit, "encrypt", &EncryptRequest {
                plaintext: &encoded,
            })
            .await
            .map_err(|e| e.into_driver_error("encrypt"))?;
        Ok(data.ciphertext.into_bytes())
    }

    #[instrument(skip_all, fields(key = %self.key_name))]
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DriverError> {
        let transit = self.transit()?;
        let ciphertext = std::str::from_utf8(ciphertext).map_err(|e| DriverError::Operation {
            op: "decrypt",
            reason: format!("ciphertext is not valid UTF-8: {e}"),
        })?;
        let data: DecryptData = self
            .post(transit, "decrypt", &DecryptRequest { ciphertext })
            .await
            .map_err(|e| e.into_driver_error("decrypt"))?;
        BASE64
            .decode(data.plaintext)
            .map_err(|e| VaultError::Response(format!("plaintext is not base64: {e}")))
            .map_err(|e| e.into_driver_error("decrypt"))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.transit = None;
        Ok(())
    }
}

/// Opener for `hashivault://` URLs; settings are read from the environment
/// on every open.
#[derive(Debug, Default, Clone, Copy)]
pub struct VaultOpener;

#[async_trait]
impl DriverOpener for VaultOpener {
    async fn open(&self, url: &str) -> Result<Box<dyn Driver>, DriverError> {
        let driver = VaultConfig::from_env()
            .and_then(|config| VaultDriver::open(url, &config))
            .map_err(|e| e.into_driver_error("open"))?;
        Ok(Box::new(driver))
    }
}
