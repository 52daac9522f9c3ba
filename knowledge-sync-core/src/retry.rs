//! Bounded retry with backoff around a single remote call.
//!
//! Only [`RemoteError::Unavailable`] is retried. Each attempt is capped by the policy's
//! timeout, and a timed-out attempt counts as unavailable.

use std::future::Future;
use tracing::{info, warn};

use crate::config::RetryPolicy;
use crate::contract::RemoteError;

/// Runs `call` until it succeeds or fails for good. Transient failures are retried
/// until the attempt budget is spent.
///
/// The closure receives the 1-based attempt number so callers can verify remote
/// state before repeating a non-idempotent request.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RemoteError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.attempt_timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Unavailable(format!(
                "{operation} timed out after {:?}",
                policy.attempt_timeout
            ))),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(operation, attempts = attempt, error = %err, "Retry budget exhausted");
                }
                return Err(err);
            }
        }
    }
}
