use std::{fmt, time::Duration};

use kms_core::driver::DriverError;
use kms_secret::SecretError;
use serde::Serialize;
use thiserror::Error;

/// Façade operation, used to label errors and log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Encrypt,
    Decrypt,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Encrypt => "encrypt",
            Operation::Decrypt => "decrypt",
        })
    }
}

/// Coarse error class reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    State,
    Backend,
    Derivation,
    Crypto,
}

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("wrong secret status")]
    State,

    #[error("unable to open keeper {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: DriverError,
    },

    #[error("unable to {op} with keeper {url}: {source}")]
    Backend {
        op: Operation,
        url: String,
        #[source]
        source: DriverError,
    },

    #[error("{op} with keeper {url} timed out after {after:?}")]
    Timeout {
        op: Operation,
        url: String,
        after: Duration,
    },

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("{0}")]
    Crypto(String),
}

impl KmsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KmsError::Input(_) => ErrorKind::Input,
            KmsError::State => ErrorKind::State,
            KmsError::Open { .. } | KmsError::Backend { .. } | KmsError::Timeout { .. } => {
                ErrorKind::Backend
            }
            KmsError::Derivation(_) => ErrorKind::Derivation,
            KmsError::Crypto(_) => ErrorKind::Crypto,
        }
    }
}

impl From<SecretError> for KmsError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::WrongStatus => KmsError::State,
            SecretError::InvalidSecret(reason) => KmsError::Input(reason),
            SecretError::Derivation(reason) => KmsError::Derivation(reason),
            err @ (SecretError::Encryption(_) | SecretError::Decryption) => {
                KmsError::Crypto(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_errors_keep_their_class() {
        assert_eq!(KmsError::from(SecretError::WrongStatus).kind(), ErrorKind::State);
        assert_eq!(
            KmsError::from(SecretError::InvalidSecret("bad hex".into())).kind(),
            ErrorKind::Input
        );
        assert_eq!(
            KmsError::from(SecretError::Derivation("hkdf".into())).kind(),
            ErrorKind::Derivation
        );
        assert_eq!(KmsError::from(SecretError::Decryption).kind(), ErrorKind::Crypto);
    }

    #[test]
    fn backend_failures_share_a_class() {
        let open = KmsError::Open {
            url: "ocikeyvault://k".into(),
            source: DriverError::Closed,
        };
        let timeout = KmsError::Timeout {
            op: Operation::Decrypt,
            url: "ocikeyvault://k".into(),
            after: Duration::from_secs(15),
        };
        assert_eq!(open.kind(), ErrorKind::Backend);
        assert_eq!(timeout.kind(), ErrorKind::Backend);
        assert_eq!(
            timeout.to_string(),
            "decrypt with keeper ocikeyvault://k timed out after 15s"
        );
    }
}
