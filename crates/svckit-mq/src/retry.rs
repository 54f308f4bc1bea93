//! Bounded, cancellable retry loop shared by publishing and connecting.

use std::future::Future;

use svckit_core::{Error, config::RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Why [`retry`] gave up.
#[derive(Debug)]
pub struct RetryFailure {
    /// Attempts actually made before giving up.
    pub attempts: u32,
    /// The last attempt's error, or `Error::Cancelled`.
    pub error: Error,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted.
///
/// `op` receives the 1-based attempt number. Cancellation is checked before
/// every attempt and raced against every delay, so a cancelled token stops
/// the loop without starting another attempt.
///
/// # Errors
///
/// Returns a [`RetryFailure`] carrying the number of attempts made and either
/// the last underlying error or `Error::Cancelled`.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryFailure {
                attempts,
                error: Error::Cancelled,
            });
        }

        attempts += 1;
        let error = match op(attempts).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() || attempts >= max_attempts {
            return Err(RetryFailure { attempts, error });
        }

        let delay = policy.delay_for(attempts);
        warn!(
            operation,
            attempt = attempts,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Attempt failed, retrying"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(RetryFailure {
                    attempts,
                    error: Error::Cancelled,
                });
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}
