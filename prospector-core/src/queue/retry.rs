use std::future::Future;

use tracing::warn;

use super::config::RetryConfig;
use crate::error::Result;

/// Run `op` until it succeeds, fails permanently, or `policy.max_attempts`
/// transient failures have occurred.
///
/// Only errors reporting [`is_transient`](crate::ProspectorError::is_transient)
/// are retried.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u16 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(operation, attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
