//! Retry policy for HTTP dispatches.
//!
//! Only `GET` is retried. Attempts are immediate, with no delay in between.

use std::future::Future;

use http::Method;
use tracing::{info, warn};

use super::error::DispatchError;
use super::request::DispatchResponse;
use crate::config::DispatchSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries used when the request does not ask for a count.
    pub default_retries: u32,
    /// Upper bound on retries, whatever the request asks for.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_retries: 2,
            max_retries: 4,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            default_retries: settings.default_retry_count,
            max_retries: settings.max_retry_count,
        }
    }

    /// Total attempts, initial one included.
    pub fn attempts(&self, method: &Method, requested: Option<u32>) -> u32 {
        if method != Method::GET {
            return 1;
        }
        1 + requested
            .unwrap_or(self.default_retries)
            .min(self.max_retries)
    }
}

/// A transport failure or a 5xx response. Timeouts are never retried.
pub fn is_retryable(outcome: &Result<DispatchResponse, DispatchError>) -> bool {
    match outcome {
        Ok(response) => response.status.is_server_error(),
        Err(err) => err.is_transport_failure(),
    }
}

/// Run `f` until it succeeds, fails permanently, or attempts run out.
/// The last outcome is returned as-is.
pub async fn retry_dispatch<F, Fut>(
    policy: &RetryPolicy,
    target: &str,
    method: &Method,
    requested: Option<u32>,
    mut f: F,
) -> Result<DispatchResponse, DispatchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<DispatchResponse, DispatchError>>,
{
    let attempts = policy.attempts(method, requested);
    let mut attempt = 1;

    loop {
        let outcome = f(attempt).await;

        if !is_retryable(&outcome) {
            if attempt > 1 {
                info!(
                    target_service = target,
                    attempt,
                    "Dispatch settled after retry"
                );
            }
            return outcome;
        }

        if attempt >= attempts {
            if attempts > 1 {
                warn!(
                    target_service = target,
                    attempts,
                    "Dispatch failed after max retries"
                );
            }
            return outcome;
        }

        match &outcome {
            Ok(response) => warn!(
                target_service = target,
                attempt,
                status = response.status.as_u16(),
                "Dispatch got server error, retrying"
            ),
            Err(err) => warn!(
                target_service = target,
                attempt,
                error = %err,
                "Dispatch transport failure, retrying"
            ),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{TransportKind, Unavailability};
    use http::StatusCode;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn response(status: StatusCode) -> Result<DispatchResponse, DispatchError> {
        Ok(DispatchResponse::new(status, Value::Null, TransportKind::Http))
    }

    #[test]
    fn test_attempts() {
        let policy = RetryPolicy {
            default_retries: 2,
            max_retries: 4,
        };
        assert_eq!(policy.attempts(&Method::GET, None), 3);
        assert_eq!(policy.attempts(&Method::GET, Some(1)), 2);
        assert_eq!(policy.attempts(&Method::GET, Some(10)), 5);
        assert_eq!(policy.attempts(&Method::GET, Some(0)), 1);
        assert_eq!(policy.attempts(&Method::POST, Some(10)), 1);
        assert_eq!(policy.attempts(&Method::DELETE, None), 1);
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&response(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(is_retryable(&response(StatusCode::SERVICE_UNAVAILABLE)));
        assert!(!is_retryable(&response(StatusCode::NOT_FOUND)));
        assert!(!is_retryable(&response(StatusCode::OK)));
        assert!(is_retryable(&Err(DispatchError::Unavailable {
            service: "x".into(),
            reason: Unavailability::Disconnected,
            detail: String::new(),
        })));
        assert!(!is_retryable(&Err(DispatchError::Timeout {
            service: "x".into(),
            timeout: Duration::from_secs(1),
        })));
    }

    #[tokio::test]
    async fn test_retries_server_errors_up_to_bound() {
        let calls = AtomicU32::new(0);
        let outcome = retry_dispatch(&RetryPolicy::default(), "x", &Method::GET, Some(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { response(StatusCode::INTERNAL_SERVER_ERROR) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.unwrap().status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_stops_on_client_error() {
        let calls = AtomicU32::new(0);
        let outcome = retry_dispatch(&RetryPolicy::default(), "x", &Method::GET, Some(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { response(StatusCode::BAD_REQUEST) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.unwrap().status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let outcome = retry_dispatch(&RetryPolicy::default(), "x", &Method::GET, None, |attempt| async move {
            if attempt < 2 {
                Err(DispatchError::Unavailable {
                    service: "x".into(),
                    reason: Unavailability::ConnectionRefused,
                    detail: String::new(),
                })
            } else {
                response(StatusCode::OK)
            }
        })
        .await;

        assert_eq!(outcome.unwrap().status, StatusCode::OK);
    }
}
