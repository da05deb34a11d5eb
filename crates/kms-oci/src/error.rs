use kms_core::driver::DriverError;
use thiserror::Error;

/// Errors produced by the OCI backend.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unable to get instance principal configuration provider: {0}")]
    WorkloadIdentity(String),

    #[error("unable to create crypto client: {0}")]
    Client(String),

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service error (status {status}, code {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error("malformed response: {0}")]
    Response(String),
}

impl OciError {
    fn into_driver_error(self, op: &'static str) -> DriverError {
        match self {
            OciError::InvalidUrl(reason) => DriverError::InvalidUrl { reason },
            err @ (OciError::Config(_)
            | OciError::WorkloadIdentity(_)
            | OciError::Client(_)) => DriverError::Open {
                reason: err.to_string(),
            },
            err => DriverError::Operation {
                op,
                reason: err.to_string(),
            },
        }
    }

    pub(crate) fn on_open(self) -> DriverError {
        self.into_driver_error("open")
    }

    pub(crate) fn on_encrypt(self) -> DriverError {
        self.into_driver_error("encrypt")
    }

    pub(crate) fn on_decrypt(self) -> DriverError {
        self.into_driver_error("decrypt")
    }
}
