use thiserror::Error;

/// Errors produced by the local envelope tier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("wrong secret status")]
    WrongStatus,

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: message authentication failed")]
    Decryption,
}

pub type Result<T> = std::result::Result<T, SecretError>;
