//! Encrypt/decrypt façade exposed to the file-transfer server: wraps a
//! payload locally when a master key is configured, then hands it to the
//! key management backend selected by URL.

pub mod error;
pub mod registry;
pub mod service;

pub use error::{ErrorKind, KmsError, Operation};
pub use registry::{loggable_url, DriverRegistry};
pub use service::{EncryptedPayload, KmsService, DEFAULT_TIMEOUT};
