//! Driver for OCI Vault crypto endpoints (`ocikeyvault://<key-ocid>`).
//! Credentials come either from an API key profile or from the workload
//! identity the platform provisions; every call runs under a bounded retry
//! policy.

pub mod auth;
pub mod client;
pub mod driver;
pub mod error;
pub mod instance;
pub mod retry;

pub use driver::{OciDriver, OciOpener, ENDPOINT_ENV, OCI_URL_PREFIX};
pub use error::OciError;
