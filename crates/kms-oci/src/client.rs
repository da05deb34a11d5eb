use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::{sign_request, ConfigurationProvider},
    error::OciError,
};

/// Path prefix of the OCI KMS crypto API.
pub const API_VERSION_PATH: &str = "/20180608";

/// Crypto operations of an OCI Vault endpoint.
#[async_trait]
pub trait CryptoClient: Send + Sync {
    async fn encrypt(&self, key_id: &str, plaintext: &str) -> Result<String, OciError>;

    async fn decrypt(&self, key_id: &str, ciphertext: &str) -> Result<String, OciError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptDataDetails<'a> {
    key_id: &'a str,
    plaintext: &'a str,
}

#[derive(Debug, Deserialize)]
struct EncryptedData {
    ciphertext: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptDataDetails<'a> {
    key_id: &'a str,
    ciphertext: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecryptedData {
    plaintext: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceErrorBody {
    code: String,
    message: String,
}

/// REST client for the crypto endpoint of one vault.
pub struct RestCryptoClient {
    http: reqwest::Client,
    endpoint: Url,
    provider: Arc<dyn ConfigurationProvider>,
}

impl RestCryptoClient {
    pub fn new(endpoint: &str, provider: Arc<dyn ConfigurationProvider>) -> Result<Self, OciError> {
        if endpoint.trim().is_empty() {
            return Err(OciError::Client("crypto endpoint is not configured".into()));
        }
        let endpoint = Url::parse(endpoint)
            .map_err(|e| OciError::Client(format!("invalid endpoint {endpoint:?}: {e}")))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("sftpgo-plugin-kms/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OciError::Client(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            provider,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<R, OciError> {
        let url = self
            .endpoint
            .join(&format!("{API_VERSION_PATH}/{operation}"))
            .map_err(|e| OciError::Client(e.to_string()))?;
        let body = serde_json::to_vec(body).map_err(|e| OciError::Client(e.to_string()))?;
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("opc-request-id", request_id())
            .body(body)
            .build()?;
        sign_request(self.provider.as_ref(), &mut request)?;

        let response = self.http.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let err: ServiceErrorBody = response.json().await.unwrap_or_default();
            return Err(OciError::Service {
                status: status.as_u16(),
                code: err.code,
                message: err.message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| OciError::Response(e.to_string()))
    }
}

#[async_trait]
impl CryptoClient for RestCryptoClient {
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn encrypt(&self, key_id: &str, plaintext: &str) -> Result<String, OciError> {
        let data: EncryptedData = self
            .call("encrypt", &EncryptDataDetails { key_id, plaintext })
            .await?;
        Ok(data.ciphertext)
    }

    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn decrypt(&self, key_id: &str, ciphertext: &str) -> Result<String, OciError> {
        let data: DecryptedData = self
            .call("decrypt", &DecryptDataDetails { key_id, ciphertext })
            .await?;
        Ok(data.plaintext)
    }
}

fn request_id() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}
