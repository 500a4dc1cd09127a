//! Bounded retry for idempotent storage operations

use std::future::Future;
use std::time::Duration;

use helpline_shared::StorageError;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Rows written moments ago may not be visible yet, so `NotFound` is retried
/// along with transient outages.
fn is_retryable(err: &StorageError) -> bool {
    err.is_transient() || matches!(err, StorageError::NotFound(_))
}

/// Run `op` up to `policy.attempts` times with a fixed delay between attempts.
///
/// Only use for idempotent operations.
pub async fn with_bounded_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let strategy = FixedInterval::new(policy.delay).take(policy.attempts.saturating_sub(1));
    let mut attempt = 0usize;

    let result = Retry::spawn(strategy, || {
        attempt += 1;
        let current = attempt;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(Ok(value)),
                Err(e) if is_retryable(&e) => {
                    tracing::debug!(operation, attempt = current, error = %e, "Retryable storage error");
                    Err(e)
                }
                // Permanent error: stop retrying
                Err(e) => Ok(Err(e)),
            }
        }
    })
    .await
    .and_then(|result| result);

    if let Err(e) = &result {
        tracing::warn!(operation, attempts = attempt, error = %e, "Storage operation failed");
    }
    result
}
