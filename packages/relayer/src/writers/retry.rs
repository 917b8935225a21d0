//! Retry and error recovery utilities for connector calls
//!
//! Provides exponential backoff and error classification shared by the
//! watcher, submitter, tracker and executor.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ConnectorError, RejectionReason};
use crate::shutdown;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies error messages for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// The chain already has what we tried to submit
    AlreadyProcessed,
    /// Permanent failure - do not retry (invalid params, contract error)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("already known") {
        return ErrorClass::AlreadyProcessed;
    }

    // Anything the rejection mapping recognizes is settled here
    match RejectionReason::from_message(error) {
        RejectionReason::Other(_) => {}
        reason if reason.is_terminal() => return ErrorClass::AlreadyProcessed,
        _ => return ErrorClass::Permanent,
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("mismatch")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Why `with_retry` gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure {
    /// Every attempt failed transiently
    Exhausted { attempts: u32, last_error: String },
    /// A non-retryable error; returned on the attempt that produced it
    Fatal(ConnectorError),
    /// Shutdown was requested during a backoff
    Interrupted { attempts: u32, last_error: String },
}

/// Run `operation` until it succeeds, fails fatally, or the attempt budget is
/// spent. Only [`ConnectorError::Transient`] is retried.
pub async fn with_retry<F, T, Fut>(
    config: &RetryConfig,
    what: &str,
    operation: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, ConnectorError>>,
{
    with_retry_until(config, what, None, operation).await
}

/// [`with_retry`] whose backoff sleeps end early on shutdown. An attempt
/// already started always completes.
pub async fn with_retry_until<F, T, Fut>(
    config: &RetryConfig,
    what: &str,
    shutdown: Option<&watch::Receiver<bool>>,
    mut operation: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, ConnectorError>>,
{
    let mut shutdown = shutdown.cloned();
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(what, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(result);
            }
            Err(ConnectorError::Transient(message)) => {
                attempt += 1;
                if !config.should_retry(attempt) {
                    warn!(what, attempts = attempt, error = %message, "Retry budget exhausted");
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last_error: message,
                    });
                }
                let backoff = config.backoff_for_attempt(attempt - 1);
                warn!(
                    what,
                    attempt,
                    max = config.max_retries,
                    ?backoff,
                    error = %message,
                    "Retrying after backoff"
                );
                match shutdown.as_mut() {
                    Some(shutdown) => {
                        if shutdown::sleep_or_shutdown(backoff, shutdown).await {
                            debug!(what, attempts = attempt, "Retry interrupted by shutdown");
                            return Err(RetryFailure::Interrupted {
                                attempts: attempt,
                                last_error: message,
                            });
                        }
                    }
                    None => tokio::time::sleep(backoff).await,
                }
            }
            Err(e) => {
                debug!(what, error = %e, "Not retrying");
                return Err(RetryFailure::Fatal(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionReason;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("HTTP 503"), ErrorClass::Transient);
        assert_eq!(
            classify_error("relayer already voted"),
            ErrorClass::AlreadyProcessed
        );
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_classification_matches_rejection_reasons() {
        for message in [
            "proposal cancelled",
            "proposal canceled by admin",
            "proposal executed",
            "proposal passed",
            "proposal expired",
        ] {
            assert!(RejectionReason::from_message(message).is_terminal(), "{}", message);
            assert_eq!(classify_error(message), ErrorClass::AlreadyProcessed, "{}", message);
        }
        for message in ["sender is not a relayer", "unauthorized", "proposal not passed"] {
            assert!(!RejectionReason::from_message(message).is_terminal(), "{}", message);
            assert_eq!(classify_error(message), ErrorClass::Permanent, "{}", message);
        }
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ConnectorError::Transient("timeout".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let slow = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 1.0,
        };
        let (stop, shutdown) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let retrying = with_retry_until(&slow, "test", Some(&shutdown), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ConnectorError::Transient("timeout".into())) }
        });
        stop.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), retrying)
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(RetryFailure::Interrupted { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConnectorError::Transient("down".into())) }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryFailure::Exhausted {
                attempts: 5,
                last_error: "down".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_rejection() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ConnectorError::Rejected(
                    RejectionReason::AlreadyExecuted,
                ))
            }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryFailure::Fatal(ConnectorError::Rejected(
                RejectionReason::AlreadyExecuted
            )))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
