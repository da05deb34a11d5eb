use std::{collections::HashMap, sync::Arc};

use kms_core::driver::{Driver, DriverError, DriverOpener};
use kms_oci::{OciOpener, OCI_URL_PREFIX};
use kms_secret::{keeper::BASE64_KEY_SCHEME, LocalKeeperOpener};
use kms_vault::{VaultOpener, VAULT_SCHEME};
use tracing::debug;

/// Maps KMS URLs to driver openers.
///
/// Prefix entries are consulted first, in registration order; only then is
/// the URL scheme looked up in the generic table.
#[derive(Default)]
pub struct DriverRegistry {
    prefixes: Vec<(String, Arc<dyn DriverOpener>)>,
    schemes: HashMap<String, Arc<dyn DriverOpener>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend built into the plugin.
    pub fn with_defaults(oci_endpoint: Option<String>) -> Self {
        let mut registry = Self::new();
        registry.register_prefix(OCI_URL_PREFIX, Arc::new(OciOpener::new(oci_endpoint)));
        registry.register_scheme(BASE64_KEY_SCHEME, Arc::new(LocalKeeperOpener));
        registry.register_scheme(VAULT_SCHEME, Arc::new(VaultOpener));
        registry
    }

    pub fn register_prefix(&mut self, prefix: impl Into<String>, opener: Arc<dyn DriverOpener>) {
        self.prefixes.push((prefix.into(), opener));
    }

    pub fn register_scheme(&mut self, scheme: impl Into<String>, opener: Arc<dyn DriverOpener>) {
        self.schemes.insert(scheme.into(), opener);
    }

    pub fn resolve(&self, url: &str) -> Result<Arc<dyn DriverOpener>, DriverError> {
        if let Some((prefix, opener)) = self.prefixes.iter().find(|(p, _)| url.starts_with(p)) {
            debug!(prefix = %prefix, "matched keeper prefix");
            return Ok(opener.clone());
        }
        let scheme = scheme_of(url)?;
        self.schemes
            .get(scheme)
            .cloned()
            .ok_or_else(|| DriverError::UnsupportedScheme {
                scheme: scheme.to_string(),
            })
    }

    pub async fn open(&self, url: &str) -> Result<Box<dyn Driver>, DriverError> {
        self.resolve(url)?.open(url).await
    }
}

fn scheme_of(url: &str) -> Result<&str, DriverError> {
    match url.split_once("://") {
        Some((scheme, _)) if !scheme.is_empty() => Ok(scheme),
        _ => Err(DriverError::InvalidUrl {
            reason: "missing URL scheme".into(),
        }),
    }
}

/// URL form safe for log records. Static-key URLs carry the key itself.
pub fn loggable_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, _)) if scheme == BASE64_KEY_SCHEME => format!("{scheme}://[REDACTED]"),
        _ => url.to_string(),
    }
}
