//! Instance principal credentials.
//!
//! A compute instance proves its identity with the X.509 certificate and key
//! served by the instance metadata service. The certificate is exchanged at
//! the regional auth service for a session token bound to a freshly
//! generated key; requests are then signed with `ST$<token>`.

use std::{fmt::Display, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use rsa::{
    pkcs8::{EncodePublicKey, LineEnding},
    RsaPrivateKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    auth::{parse_private_key, sign_request, ConfigurationProvider},
    error::OciError,
};

pub const METADATA_BASE_URL: &str = "http://169.254.169.254/opc/v2/";

const METADATA_AUTHORIZATION: &str = "Bearer Oracle";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SESSION_KEY_BITS: usize = 2048;

/// Where to federate from. Defaults target the live metadata service and the
/// auth endpoint of the instance region.
#[derive(Debug, Clone)]
pub struct InstancePrincipalConfig {
    pub metadata_base_url: String,
    /// Federation endpoint; derived from the instance region when `None`.
    pub federation_url: Option<String>,
    pub session_key_bits: usize,
}

impl Default for InstancePrincipalConfig {
    fn default() -> Self {
        Self {
            metadata_base_url: METADATA_BASE_URL.to_string(),
            federation_url: None,
            session_key_bits: SESSION_KEY_BITS,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FederationRequest {
    certificate: String,
    public_key: String,
    intermediate_certificates: Vec<String>,
    purpose: &'static str,
    fingerprint_algorithm: &'static str,
}

#[derive(Debug, Deserialize)]
struct FederationResponse {
    token: String,
}

/// Signs the federation call with the instance certificate key.
struct CertificateSigner {
    key_id: String,
    key: RsaPrivateKey,
}

impl ConfigurationProvider for CertificateSigner {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }
}

/// Session credentials obtained through certificate federation.
pub struct InstancePrincipalProvider {
    token: String,
    session_key: RsaPrivateKey,
}

impl InstancePrincipalProvider {
    #[instrument(skip_all, fields(metadata = %config.metadata_base_url))]
    pub async fn federate(config: &InstancePrincipalConfig) -> Result<Self, OciError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(identity_error)?;
        let metadata = Url::parse(&config.metadata_base_url).map_err(identity_error)?;

        let leaf_pem = get_metadata(&http, &metadata, "identity/cert.pem").await?;
        let intermediate_pem = get_metadata(&http, &metadata, "identity/intermediate.pem").await?;
        let key_pem = get_metadata(&http, &metadata, "identity/key.pem").await?;
        let instance_key = parse_private_key(&key_pem).map_err(identity_error)?;

        let leaf_der = pem_to_der(&leaf_pem)?;
        let tenancy = tenancy_from_certificate(&leaf_der)?;
        let federation_url = match &config.federation_url {
            Some(url) => Url::parse(url).map_err(identity_error)?,
            None => {
                let region = get_metadata(&http, &metadata, "instance/canonicalRegionName").await?;
                federation_url_for_region(region.trim())?
            }
        };
        debug!(%tenancy, %federation_url, "federating instance certificate");

        let bits = config.session_key_bits;
        let session_key =
            tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut rand::thread_rng(), bits))
                .await
                .map_err(identity_error)?
                .map_err(identity_error)?;
        let public_pem = session_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(identity_error)?;

        let body = FederationRequest {
            certificate: pem_body(&leaf_pem),
            public_key: pem_body(&public_pem),
            intermediate_certificates: vec![pem_body(&intermediate_pem)],
            purpose: "DEFAULT",
            fingerprint_algorithm: "SHA256",
        };
        let signer = CertificateSigner {
            key_id: format!("{tenancy}/fed-x509-sha256/{}", fingerprint(&leaf_der)),
            key: instance_key,
        };
        let mut request = http
            .post(federation_url)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&body).map_err(identity_error)?)
            .build()
            .map_err(identity_error)?;
        sign_request(&signer, &mut request)?;

        let response = http.execute(request).await.map_err(identity_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(OciError::WorkloadIdentity(format!(
                "federation failed with status {status}"
            )));
        }
        let federated: FederationResponse = response.json().await.map_err(identity_error)?;
        Ok(Self {
            token: federated.token,
            session_key,
        })
    }
}

impl ConfigurationProvider for InstancePrincipalProvider {
    fn key_id(&self) -> String {
        format!("ST${}", self.token)
    }

    fn private_key(&self) -> &RsaPrivateKey {
        &self.session_key
    }
}

async fn get_metadata(http: &reqwest::Client, base: &Url, path: &str) -> Result<String, OciError> {
    let url = base.join(path).map_err(identity_error)?;
    let response = http
        .get(url)
        .header(AUTHORIZATION, METADATA_AUTHORIZATION)
        .send()
        .await
        .map_err(identity_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(OciError::WorkloadIdentity(format!(
            "metadata {path} returned status {status}"
        )));
    }
    response.text().await.map_err(identity_error)
}

fn identity_error(err: impl Display) -> OciError {
    OciError::WorkloadIdentity(err.to_string())
}

fn federation_url_for_region(region: &str) -> Result<Url, OciError> {
    if region.is_empty() {
        return Err(OciError::WorkloadIdentity("instance region is empty".into()));
    }
    Url::parse(&format!("https://auth.{region}.oraclecloud.com/v1/x509")).map_err(identity_error)
}

/// Base64 body of a PEM document, without armor lines or line breaks.
fn pem_body(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect()
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, OciError> {
    STANDARD
        .decode(pem_body(pem))
        .map_err(|e| OciError::WorkloadIdentity(format!("certificate is not PEM: {e}")))
}

/// Colon separated upper-case SHA-256 of the DER certificate.
fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Tenancy OCID carried in a subject attribute of the instance certificate.
fn tenancy_from_certificate(der: &[u8]) -> Result<String, OciError> {
    ["opc-tenant:", "opc-identity:"]
        .into_iter()
        .find_map(|prefix| find_der_string(der, prefix))
        .ok_or_else(|| OciError::WorkloadIdentity("certificate names no tenancy".into()))
}

fn find_der_string(der: &[u8], prefix: &str) -> Option<String> {
    let marker = prefix.as_bytes();
    der.windows(marker.len())
        .enumerate()
        .filter(|(_, window)| *window == marker)
        .find_map(|(start, _)| {
            let len = der_string_len(&der[..start])?;
            let value = std::str::from_utf8(der.get(start..start + len)?).ok()?;
            value
                .strip_prefix(prefix)
                .filter(|ocid| !ocid.is_empty())
                .map(str::to_string)
        })
}

/// Length of the DER string whose value starts right after `header`.
fn der_string_len(header: &[u8]) -> Option<usize> {
    // UTF8String, PrintableString, IA5String
    const STRING_TAGS: [u8; 3] = [0x0c, 0x13, 0x16];
    match header {
        [.., tag, 0x81, len] if STRING_TAGS.contains(tag) => Some(usize::from(*len)),
        [.., tag, len] if STRING_TAGS.contains(tag) && *len < 0x80 => Some(usize::from(*len)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use rsa::pkcs8::EncodePrivateKey;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    const TENANCY: &str = "ocid1.tenancy.oc1..aaaatest";

    /// DER fragment shaped like a certificate subject with one OU attribute.
    fn subject_with(ou: &str) -> Vec<u8> {
        let mut der = vec![0x31, 0x00, 0x30, 0x00, 0x06, 0x03, 0x55, 0x04, 0x0b, 0x0c];
        der.push(u8::try_from(ou.len()).expect("short OU"));
        der.extend_from_slice(ou.as_bytes());
        der.extend_from_slice(&[0x31, 0x0b, 0x30, 0x09]);
        der
    }

    fn pem(label: &str, der: &[u8]) -> String {
        format!(
            "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
            STANDARD.encode(der)
        )
    }

    #[test]
    fn tenancy_comes_from_subject_attribute() {
        let der = subject_with(&format!("opc-tenant:{TENANCY}"));
        assert_eq!(tenancy_from_certificate(&der).expect("tenancy"), TENANCY);

        let der = subject_with(&format!("opc-identity:{TENANCY}"));
        assert_eq!(tenancy_from_certificate(&der).expect("tenancy"), TENANCY);

        let der = subject_with("opc-instance:ocid1.instance.oc1..x");
        assert!(matches!(
            tenancy_from_certificate(&der),
            Err(OciError::WorkloadIdentity(_))
        ));
    }

    #[test]
    fn fingerprint_is_colon_separated_upper_hex() {
        let fp = fingerprint(b"certificate");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.split(':').all(|byte| {
            byte.len() == 2 && byte.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        }));
    }

    #[test]
    fn pem_body_strips_armor() {
        let der = subject_with("opc-tenant:x");
        let document = pem("CERTIFICATE", &der);
        assert_eq!(pem_body(&document), STANDARD.encode(&der));
        assert_eq!(pem_to_der(&document).expect("der"), der);
    }

    #[test]
    fn federation_endpoint_follows_region() {
        assert_eq!(
            federation_url_for_region("us-ashburn-1").expect("url").as_str(),
            "https://auth.us-ashburn-1.oraclecloud.com/v1/x509"
        );
        assert!(federation_url_for_region("").is_err());
    }

    /// Minimal HTTP/1.1 server answering one request per connection from
    /// `routes`; returns its base URL and the raw requests it saw.
    async fn fake_oci(routes: HashMap<String, String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let head_end = loop {
                    let n = stream.read(&mut chunk).await.expect("read");
                    if n == 0 {
                        break None;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break Some(pos + 4);
                    }
                };
                let Some(head_end) = head_end else { continue };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let content_length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < head_end + content_length {
                    let n = stream.read(&mut chunk).await.expect("read");
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                log.lock().expect("lock").push(String::from_utf8_lossy(&buf).to_string());
                let (status, body) = match routes.get(&path) {
                    Some(body) => ("200 OK", body.clone()),
                    None => ("404 Not Found", String::new()),
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.expect("write");
            }
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn federates_instance_certificate_for_session_token() {
        let instance_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key");
        let leaf = subject_with(&format!("opc-tenant:{TENANCY}"));
        let routes = HashMap::from([
            ("/opc/v2/identity/cert.pem".to_string(), pem("CERTIFICATE", &leaf)),
            (
                "/opc/v2/identity/intermediate.pem".to_string(),
                pem("CERTIFICATE", b"intermediate"),
            ),
            (
                "/opc/v2/identity/key.pem".to_string(),
                instance_key.to_pkcs8_pem(LineEnding::LF).expect("pem").to_string(),
            ),
            ("/v1/x509".to_string(), r#"{"token":"session-token"}"#.to_string()),
        ]);
        let (base, seen) = fake_oci(routes).await;

        let provider = InstancePrincipalProvider::federate(&InstancePrincipalConfig {
            metadata_base_url: format!("{base}/opc/v2/"),
            federation_url: Some(format!("{base}/v1/x509")),
            session_key_bits: 1024,
        })
        .await
        .expect("federate");
        assert_eq!(provider.key_id(), "ST$session-token");

        let seen = seen.lock().expect("lock");
        assert!(seen
            .iter()
            .filter(|raw| raw.contains("/opc/v2/"))
            .all(|raw| raw.to_lowercase().contains("authorization: bearer oracle")));
        let federation = seen
            .iter()
            .find(|raw| raw.starts_with("POST /v1/x509"))
            .expect("federation request");
        assert!(federation.contains(&format!(
            "keyId=\"{TENANCY}/fed-x509-sha256/{}\"",
            fingerprint(&leaf)
        )));
        assert!(federation.contains(&format!("\"certificate\":\"{}\"", STANDARD.encode(&leaf))));
        assert!(federation.contains(r#""purpose":"DEFAULT""#));
        assert!(federation.contains(r#""fingerprintAlgorithm":"SHA256""#));
    }

    #[tokio::test]
    async fn missing_metadata_is_a_workload_identity_error() {
        let (base, _) = fake_oci(HashMap::new()).await;
        let err = InstancePrincipalProvider::federate(&InstancePrincipalConfig {
            metadata_base_url: format!("{base}/opc/v2/"),
            federation_url: None,
            session_key_bits: 1024,
        })
        .await
        .err()
        .expect("should fail");
        assert!(matches!(err, OciError::WorkloadIdentity(_)));
    }
}
