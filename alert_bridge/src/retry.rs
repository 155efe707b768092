//! Bounded optimistic-concurrency retries and request deadlines.

use log::{debug, warn};
use std::future::Future;
use std::time::Duration;

use crate::error::ManagementError;

/// Re-runs a read-modify-write closure while it fails on a conflict.
///
/// Only [`StoreError::is_retryable`](crate::error::StoreError::is_retryable)
/// failures are retried; anything else is returned immediately. There is no
/// delay between attempts: each attempt starts with a fresh read.
pub async fn retry_on_conflict<F, Fut, T>(
    max_attempts: u32,
    operation: &str,
    mut f: F,
) -> Result<T, ManagementError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ManagementError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Err(ManagementError::Store(e)) if e.is_retryable() => {
                if attempt >= max_attempts {
                    warn!("{} failed after {} attempts: {}", operation, attempt, e);
                    return Err(ManagementError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                debug!("{} attempt {}/{} conflicted: {}", operation, attempt, max_attempts, e);
            }
            other => return other,
        }
    }
}

/// Fails with [`ManagementError::Timeout`] if `fut` does not finish within `timeout`.
pub async fn with_deadline<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, ManagementError>
where
    Fut: Future<Output = Result<T, ManagementError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ManagementError::Timeout(timeout)),
    }
}
