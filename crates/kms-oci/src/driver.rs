use std::sync::Arc;

use async_trait::async_trait;
use kms_core::driver::{Driver, DriverError, DriverOpener};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    auth::{load_provider, AuthType},
    client::{CryptoClient, RestCryptoClient},
    error::OciError,
    retry::RetryPolicy,
};

/// URL prefix routed to this backend.
pub const OCI_URL_PREFIX: &str = "ocikeyvault://";

/// Overrides the crypto endpoint of the vault holding the key.
pub const ENDPOINT_ENV: &str = "SFTPGO_PLUGIN_KMS_OCI_ENDPOINT";

/// Driver bound to one OCI Vault key.
pub struct OciDriver {
    key_id: String,
    client: Option<Arc<dyn CryptoClient>>,
    retry_policy: Option<RetryPolicy>,
}

impl OciDriver {
    /// Build a driver for `ocikeyvault://<key-ocid>[?auth_type_api_key=1]`.
    pub async fn open(url: &str, endpoint: &str) -> Result<Self, OciError> {
        let parsed = Url::parse(url).map_err(|e| OciError::InvalidUrl(e.to_string()))?;
        let key_id = key_id_from_url(&parsed)?;
        if endpoint.trim().is_empty() {
            return Err(OciError::Client("crypto endpoint is not configured".into()));
        }

        let auth_type = AuthType::from_url(&parsed);
        debug!(?auth_type, "selected OCI credentials");
        let provider = load_provider(auth_type).await?;

        let client = RestCryptoClient::new(endpoint, provider)?;
        Ok(Self::with_client(
            key_id,
            Arc::new(client),
            RetryPolicy::default(),
        ))
    }

    pub fn with_client(
        key_id: impl Into<String>,
        client: Arc<dyn CryptoClient>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            client: Some(client),
            retry_policy: Some(retry_policy),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn parts(&self) -> Result<(&dyn CryptoClient, &RetryPolicy), DriverError> {
        match (&self.client, &self.retry_policy) {
            (Some(client), Some(policy)) => Ok((client.as_ref(), policy)),
            _ => Err(DriverError::Closed),
        }
    }
}

fn key_id_from_url(url: &Url) -> Result<String, OciError> {
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| OciError::InvalidUrl("missing key OCID in URL host".into()))
}

#[async_trait]
impl Driver for OciDriver {
    fn name(&self) -> &'static str {
        "ocikeyvault"
    }

    #[instrument(skip_all, fields(key_id = %self.key_id))]
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, DriverError> {
        let (client, policy) = self.parts()?;
        let plaintext = std::str::from_utf8(plaintext).map_err(|e| DriverError::Operation {
            op: "encrypt",
            reason: format!("plaintext is not valid UTF-8: {e}"),
        })?;
        let ciphertext = policy
            .run("encrypt", || client.encrypt(&self.key_id, plaintext))
            .await
            .map_err(OciError::on_encrypt)?;
        Ok(ciphertext.into_bytes())
    }

    #[instrument(skip_all, fields(key_id = %self.key_id))]
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DriverError> {
        let (client, policy) = self.parts()?;
        let ciphertext = std::str::from_utf8(ciphertext).map_err(|e| DriverError::Operation {
            op: "decrypt",
            reason: format!("ciphertext is not valid UTF-8: {e}"),
        })?;
        let plaintext = policy
            .run("decrypt", || client.decrypt(&self.key_id, ciphertext))
            .await
            .map_err(OciError::on_decrypt)?;
        Ok(plaintext.into_bytes())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.client = None;
        self.retry_policy = None;
        Ok(())
    }
}

/// Opener for `ocikeyvault://` URLs. The endpoint comes from
/// `SFTPGO_PLUGIN_KMS_OCI_ENDPOINT` when set, else from configuration.
#[derive(Debug, Default, Clone)]
pub struct OciOpener {
    endpoint: Option<String>,
}

impl OciOpener {
    pub fn new(endpoint: Option<String>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> String {
        resolve_endpoint(std::env::var(ENDPOINT_ENV).ok(), self.endpoint.as_deref())
    }
}

fn resolve_endpoint(from_env: Option<String>, configured: Option<&str>) -> String {
    from_env
        .filter(|v| !v.is_empty())
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_default()
}

#[async_trait]
impl DriverOpener for OciOpener {
    async fn open(&self, url: &str) -> Result<Box<dyn Driver>, DriverError> {
        let driver = OciDriver::open(url, &self.endpoint())
            .await
            .map_err(OciError::on_open)?;
        Ok(Box::new(driver))
    }
}
