//! Credential selection and OCI request signing.
//!
//! OCI authenticates every call with an HTTP signature (`rsa-sha256`) over
//! the request target, `date`, `host` and, for requests with a body, the body
//! digest, content type and length.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer},
    RsaPrivateKey,
};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::{error::OciError, instance::InstancePrincipalProvider};

/// Query parameter selecting API key credentials when set to `1`.
pub const AUTH_TYPE_API_KEY_PARAM: &str = "auth_type_api_key";

const DEFAULT_PROFILE: &str = "DEFAULT";

/// Credential strategy requested by the KMS URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Explicit user API key from the OCI config file or `OCI_*` variables.
    ApiKey,
    /// Ambient identity of the workload the plugin runs in.
    WorkloadIdentity,
}

impl AuthType {
    pub fn from_url(url: &Url) -> Self {
        let api_key = url
            .query_pairs()
            .find(|(name, _)| name == AUTH_TYPE_API_KEY_PARAM)
            .is_some_and(|(_, value)| value == "1");
        if api_key {
            AuthType::ApiKey
        } else {
            AuthType::WorkloadIdentity
        }
    }
}

/// Source of the signing identity for OCI requests.
pub trait ConfigurationProvider: Send + Sync {
    /// Value of the `keyId` signature parameter.
    fn key_id(&self) -> String;

    fn private_key(&self) -> &RsaPrivateKey;
}

/// API key settings of one OCI config profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeySettings {
    pub tenancy: String,
    pub user: String,
    pub fingerprint: String,
    pub key_file: PathBuf,
}

impl ApiKeySettings {
    /// Resolve settings from the config file first and fill the gaps from
    /// `OCI_tenancy_ocid`, `OCI_user_ocid`, `OCI_fingerprint` and
    /// `OCI_private_key_path`.
    pub fn resolve(
        file_values: Option<HashMap<String, String>>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OciError> {
        let file_values = file_values.unwrap_or_default();
        let lookup = |file_key: &str, env_key: &str| -> Option<String> {
            file_values
                .get(file_key)
                .cloned()
                .filter(|v| !v.is_empty())
                .or_else(|| env(env_key).filter(|v| !v.is_empty()))
        };
        let required = |file_key: &str, env_key: &str| -> Result<String, OciError> {
            lookup(file_key, env_key).ok_or_else(|| {
                OciError::Config(format!("missing `{file_key}` (or {env_key}) in OCI configuration"))
            })
        };

        Ok(Self {
            tenancy: required("tenancy", "OCI_tenancy_ocid")?,
            user: required("user", "OCI_user_ocid")?,
            fingerprint: required("fingerprint", "OCI_fingerprint")?,
            key_file: expand_home(&required("key_file", "OCI_private_key_path")?),
        })
    }
}

/// Signs requests with a user API key.
pub struct ApiKeyProvider {
    settings: ApiKeySettings,
    private_key: RsaPrivateKey,
}

impl ApiKeyProvider {
    pub fn new(settings: ApiKeySettings, private_key: RsaPrivateKey) -> Self {
        Self {
            settings,
            private_key,
        }
    }

    /// Load the `DEFAULT` profile of `~/.oci/config` (or `OCI_CONFIG_FILE`),
    /// falling back to environment variables for missing entries.
    pub fn from_default_config() -> Result<Self, OciError> {
        let path = match std::env::var("OCI_CONFIG_FILE") {
            Ok(path) if !path.is_empty() => Some(PathBuf::from(path)),
            _ => dirs::home_dir().map(|home| home.join(".oci").join("config")),
        };
        let profile =
            std::env::var("OCI_CONFIG_PROFILE").unwrap_or_else(|_| DEFAULT_PROFILE.to_string());
        Self::from_config_file(path.as_deref(), &profile, |name| std::env::var(name).ok())
    }

    pub fn from_config_file(
        path: Option<&Path>,
        profile: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OciError> {
        let file_values = match path {
            Some(path) if path.exists() => {
                debug!(?path, profile, "reading OCI config file");
                let contents = fs::read_to_string(path).map_err(|e| {
                    OciError::Config(format!("unable to read {}: {e}", path.display()))
                })?;
                parse_profile(&contents, profile)
            }
            _ => None,
        };
        let settings = ApiKeySettings::resolve(file_values, env)?;
        let pem = fs::read_to_string(&settings.key_file).map_err(|e| {
            OciError::Config(format!(
                "unable to read private key {}: {e}",
                settings.key_file.display()
            ))
        })?;
        let private_key = parse_private_key(&pem)?;
        Ok(Self::new(settings, private_key))
    }

    pub fn settings(&self) -> &ApiKeySettings {
        &self.settings
    }
}

impl ConfigurationProvider for ApiKeyProvider {
    fn key_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.settings.tenancy, self.settings.user, self.settings.fingerprint
        )
    }

    fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

const RESOURCE_PRINCIPAL_TOKEN_ENV: &str = "OCI_RESOURCE_PRINCIPAL_RPST";

/// Where the workload identity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadSource {
    /// Session token and key provisioned through `OCI_RESOURCE_PRINCIPAL_*`.
    ResourcePrincipal,
    /// Certificate federation through the compute instance metadata service.
    InstancePrincipal,
}

impl WorkloadSource {
    pub fn detect(env: impl Fn(&str) -> Option<String>) -> Self {
        if env(RESOURCE_PRINCIPAL_TOKEN_ENV).is_some_and(|v| !v.is_empty()) {
            WorkloadSource::ResourcePrincipal
        } else {
            WorkloadSource::InstancePrincipal
        }
    }
}

/// Resolve the signing identity for `auth_type`. File reads and key parsing
/// run on the blocking pool.
pub async fn load_provider(auth_type: AuthType) -> Result<Arc<dyn ConfigurationProvider>, OciError> {
    let provider: Arc<dyn ConfigurationProvider> = match auth_type {
        AuthType::ApiKey => Arc::new(blocking(ApiKeyProvider::from_default_config).await?),
        AuthType::WorkloadIdentity => {
            let source = WorkloadSource::detect(|name| std::env::var(name).ok());
            debug!(?source, "resolving workload identity");
            match source {
                WorkloadSource::ResourcePrincipal => {
                    Arc::new(blocking(ResourcePrincipalProvider::from_environment).await?)
                }
                WorkloadSource::InstancePrincipal => {
                    Arc::new(InstancePrincipalProvider::federate(&Default::default()).await?)
                }
            }
        }
    };
    Ok(provider)
}

pub(crate) async fn blocking<T, F>(load: F) -> Result<T, OciError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, OciError> + Send + 'static,
{
    tokio::task::spawn_blocking(load)
        .await
        .map_err(|e| OciError::Config(format!("credential loading task failed: {e}")))?
}

/// Signs requests with the session token and key the platform provisions
/// for the running workload (`OCI_RESOURCE_PRINCIPAL_*`). Each variable holds
/// either the value itself or the path of a file containing it.
pub struct ResourcePrincipalProvider {
    token: String,
    private_key: RsaPrivateKey,
}

impl ResourcePrincipalProvider {
    pub fn from_environment() -> Result<Self, OciError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, OciError> {
        let token = env(RESOURCE_PRINCIPAL_TOKEN_ENV)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                OciError::WorkloadIdentity("OCI_RESOURCE_PRINCIPAL_RPST is not set".into())
            })?;
        let pem = env("OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                OciError::WorkloadIdentity("OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM is not set".into())
            })?;

        let token = value_or_file(&token)?.trim().to_string();
        let private_key = parse_private_key(&value_or_file(&pem)?)
            .map_err(|e| OciError::WorkloadIdentity(e.to_string()))?;
        Ok(Self { token, private_key })
    }
}

impl ConfigurationProvider for ResourcePrincipalProvider {
    fn key_id(&self) -> String {
        format!("ST${}", self.token)
    }

    fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

fn value_or_file(value: &str) -> Result<String, OciError> {
    let path = Path::new(value);
    if path.is_absolute() && path.is_file() {
        return fs::read_to_string(path).map_err(|e| {
            OciError::WorkloadIdentity(format!("unable to read {}: {e}", path.display()))
        });
    }
    Ok(value.to_string())
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Parse a PKCS#8 or PKCS#1 PEM RSA key. Encrypted keys are not supported.
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, OciError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| OciError::Config(format!("unable to parse private key: {e}")))
}

/// Values of one `[profile]` section of an OCI config file, or `None` when
/// the profile is absent.
pub fn parse_profile(contents: &str, profile: &str) -> Option<HashMap<String, String>> {
    let mut current: Option<&str> = None;
    let mut found = false;
    let mut values = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim());
            found |= current == Some(profile);
            continue;
        }
        if current != Some(profile) {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    found.then_some(values)
}

/// Add the `date`, `host`, body and `authorization` headers to a request.
pub fn sign_request(
    provider: &dyn ConfigurationProvider,
    request: &mut reqwest::Request,
) -> Result<(), OciError> {
    let url = request.url();
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(OciError::Signing("request URL has no host".into())),
    };
    let target = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };
    let method = request.method().as_str().to_lowercase();

    let mut signed: Vec<(&'static str, String)> = vec![
        ("(request-target)", format!("{method} {target}")),
        ("date", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
        ("host", host),
    ];
    if matches!(method.as_str(), "post" | "put" | "patch") {
        let body = request.body().and_then(|b| b.as_bytes()).unwrap_or_default();
        signed.push(("x-content-sha256", STANDARD.encode(Sha256::digest(body))));
        signed.push(("content-type", "application/json".to_string()));
        signed.push(("content-length", body.len().to_string()));
    }

    let signing_string = signing_string(&signed);
    let signature = SigningKey::<Sha256>::new(provider.private_key().clone())
        .try_sign(signing_string.as_bytes())
        .map_err(|e| OciError::Signing(e.to_string()))?;
    let names = signed
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(" ");
    let authorization = format!(
        "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{names}\",signature=\"{}\"",
        provider.key_id(),
        STANDARD.encode(signature.to_bytes())
    );

    let headers = request.headers_mut();
    for (name, value) in signed.iter().skip(1) {
        headers.insert(HeaderName::from_static(*name), header_value(value)?);
    }
    headers.insert(reqwest::header::AUTHORIZATION, header_value(&authorization)?);
    Ok(())
}

fn signing_string(signed: &[(&'static str, String)]) -> String {
    signed
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn header_value(value: &str) -> Result<HeaderValue, OciError> {
    HeaderValue::from_str(value).map_err(|e| OciError::Signing(e.to_string()))
}
