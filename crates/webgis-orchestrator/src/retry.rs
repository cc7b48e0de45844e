//! Retry of transient remote failures with exponential backoff

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use webgis_core::{Result, RetryConfig};

/// Run `call` until it succeeds, fails non-transiently, runs out of retries, or
/// `stop` fires during a backoff pause. `on_backoff` is told the upcoming attempt
/// number before the pause, `on_resume` right before that attempt is issued.
///
/// A call that has started is always awaited to completion; `stop` is only
/// observed between attempts.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    stop: &CancellationToken,
    mut on_backoff: impl FnMut(u32),
    mut on_resume: impl FnMut(u32),
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for(attempt);
                warn!(
                    "Transient failure ({}), retrying in {:?} (attempt {}/{})",
                    e, delay, attempt, config.max_retries
                );
                on_backoff(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.cancelled() => return Err(e),
                }
                on_resume(attempt);
            }
            Err(e) => return Err(e),
        }
    }
}
