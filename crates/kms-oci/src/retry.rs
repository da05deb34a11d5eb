use std::{fmt, future::Future, time::Duration};

use tracing::warn;

use crate::error::OciError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Decides whether a failed call may be attempted again.
pub type ShouldRetry = fn(&OciError) -> bool;

/// Fixed-backoff retry policy applied to every crypto call.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    should_retry: ShouldRetry,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            should_retry: default_should_retry,
        }
    }

    pub fn with_should_retry(mut self, should_retry: ShouldRetry) -> Self {
        self.should_retry = should_retry;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Run `call` until it succeeds, fails permanently or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, OciError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OciError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && (self.should_retry)(&err) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        "retrying after error: {err}"
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Transient failures: timeouts, connection errors, throttling, server-side
/// unavailability and conflicting resource state. Anything else is permanent.
pub fn default_should_retry(err: &OciError) -> bool {
    match err {
        OciError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        OciError::Service { status, code, .. } => match status {
            409 => code == "IncorrectState",
            429 | 500 | 502 | 503 | 504 => true,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    fn service(status: u16, code: &str) -> OciError {
        OciError::Service {
            status,
            code: code.into(),
            message: "test".into(),
        }
    }

    #[test]
    fn default_policy_matches_backend_contract() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff(), Duration::from_secs(2));
    }

    #[test]
    fn classifies_transient_and_permanent_failures() {
        assert!(default_should_retry(&service(429, "TooManyRequests")));
        assert!(default_should_retry(&service(503, "ServiceUnavailable")));
        assert!(default_should_retry(&service(409, "IncorrectState")));
        assert!(!default_should_retry(&service(409, "Conflict")));
        assert!(!default_should_retry(&service(401, "NotAuthenticated")));
        assert!(!default_should_retry(&service(404, "NotAuthorizedOrNotFound")));
        assert!(!default_should_retry(&OciError::Response("bad json".into())));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<&str, OciError> = policy
            .run("encrypt", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(service(503, "ServiceUnavailable"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.expect("second attempt succeeds"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<(), OciError> = policy
            .run("decrypt", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(service(429, "TooManyRequests"))
                }
            })
            .await;
        assert!(matches!(result, Err(OciError::Service { status: 429, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<(), OciError> = policy
            .run("encrypt", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(service(401, "NotAuthenticated"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_predicate_overrides_default() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(1)).with_should_retry(|_| true);
        let _: Result<(), OciError> = policy
            .run("encrypt", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(service(400, "InvalidParameter"))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
