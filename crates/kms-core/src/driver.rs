use std::{
    ops::Deref,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Errors produced by driver implementations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No driver is registered for the URL scheme.
    #[error("unsupported KMS URL scheme: {scheme}")]
    UnsupportedScheme { scheme: String },
    /// The URL could not be parsed or misses a required component.
    #[error("invalid KMS URL: {reason}")]
    InvalidUrl { reason: String },
    /// Driver construction failed (credentials, client, configuration).
    #[error("unable to open driver: {reason}")]
    Open { reason: String },
    /// A remote encrypt/decrypt call failed.
    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
    /// The driver was used after `close`.
    #[error("driver is closed")]
    Closed,
}

/// Minimal capability required of any key management backend.
///
/// Deadlines are carried by the caller: dropping an in-flight future cancels
/// the remote call.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short name used for logging.
    fn name(&self) -> &'static str;

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, DriverError>;

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DriverError>;

    /// Release client resources. Must be idempotent.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Builds a driver for a KMS URL.
#[async_trait]
pub trait DriverOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Driver>, DriverError>;
}

/// Owns a driver for the duration of one call and closes it on every exit
/// path, including cancellation of the enclosing future.
pub struct ScopedDriver {
    inner: Option<Box<dyn Driver>>,
}

impl ScopedDriver {
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            inner: Some(driver),
        }
    }
}

impl Deref for ScopedDriver {
    type Target = dyn Driver;

    fn deref(&self) -> &Self::Target {
        // `inner` is only taken in `drop`.
        self.inner
            .as_deref()
            .unwrap_or(&CLOSED_DRIVER as &dyn Driver)
    }
}

impl Drop for ScopedDriver {
    fn drop(&mut self) {
        if let Some(mut driver) = self.inner.take() {
            if let Err(err) = driver.close() {
                warn!(driver = driver.name(), "unable to close driver: {err}");
            }
        }
    }
}

struct ClosedDriver;

static CLOSED_DRIVER: ClosedDriver = ClosedDriver;

#[async_trait]
impl Driver for ClosedDriver {
    fn name(&self) -> &'static str {
        "closed"
    }

    async fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::Closed)
    }

    async fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::Closed)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Driver that returns its input unchanged; useful for tests and offline
/// smoke checks of the local envelope tier.
#[derive(Debug, Default)]
pub struct IdentityDriver {
    closed: AtomicBool,
}

impl IdentityDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for IdentityDriver {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, DriverError> {
        self.ensure_open()?;
        Ok(plaintext.to_vec())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DriverError> {
        self.ensure_open()?;
        Ok(ciphertext.to_vec())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opener handing out a fresh `IdentityDriver` for any URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityOpener;

#[async_trait]
impl DriverOpener for IdentityOpener {
    async fn open(&self, _url: &str) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(IdentityDriver::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct CountingDriver {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for CountingDriver {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, DriverError> {
            Err(DriverError::Operation {
                op: "encrypt",
                reason: "boom".into(),
            })
        }

        async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DriverError> {
            Ok(ciphertext.to_vec())
        }

        fn close(&mut self) -> Result<(), DriverError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn identity_driver_round_trips_until_closed() {
        let mut driver = IdentityDriver::new();
        let sealed = driver.encrypt(b"payload").await.expect("encrypt");
        assert_eq!(driver.decrypt(&sealed).await.expect("decrypt"), b"payload");

        driver.close().expect("close");
        driver.close().expect("close again");
        let err = driver.encrypt(b"payload").await.expect_err("closed");
        assert!(matches!(err, DriverError::Closed));
    }

    #[tokio::test]
    async fn scoped_driver_closes_on_error_path() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let scoped = ScopedDriver::new(Box::new(CountingDriver {
                closes: closes.clone(),
            }));
            scoped.encrypt(b"x").await.expect_err("encrypt fails");
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identity_opener_builds_fresh_drivers() {
        let driver = IdentityOpener.open("any://thing").await.expect("open");
        assert_eq!(driver.name(), "identity");
    }
}
