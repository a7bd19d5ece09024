//! Conflict retry and cancellation helpers

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::metrics::CONFLICT_RETRIES;
use crate::{Error, Result};

/// Race `future` against `cancel`, yielding `Error::Cancelled` if the token
/// fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

/// Run `attempt` until it succeeds, fails with a non-conflict error, or the
/// policy's step budget is used up
///
/// Every attempt must re-read its baseline; a conflict means the stored object
/// moved on and anything derived from the previous read is stale.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut step = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_conflict() && step + 1 < policy.steps => {
                let delay = policy.delay_for(step);
                step += 1;
                CONFLICT_RETRIES.with_label_values(&[operation]).inc();
                warn!(
                    operation,
                    attempt = step,
                    delay_ms = delay.as_millis() as u64,
                    "Write conflict, retrying from a fresh read: {}",
                    e
                );
                cancellable(cancel, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
            Err(e) => {
                if e.is_conflict() {
                    debug!(operation, attempts = step + 1, "Retry budget exhausted");
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}
