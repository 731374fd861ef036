use crate::error::{RecoveryError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Call `attempt` every `interval` until it succeeds or `timeout` elapses.
///
/// The last attempt's error is folded into the returned [`RecoveryError::Timeout`].
/// Cancellation stops the loop immediately.
pub async fn with_timeout<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    name: &str,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let deadline = Instant::now() + timeout;
    let mut tries = 0u32;
    loop {
        tries += 1;
        let last = match attempt().await {
            Ok(()) => {
                tracing::debug!(name, tries, "retry succeeded");
                return Ok(());
            }
            Err(RecoveryError::Cancelled) => return Err(RecoveryError::Cancelled),
            Err(e) => e,
        };
        if Instant::now() + interval > deadline {
            return Err(RecoveryError::Timeout(format!(
                "{name}: gave up after {tries} attempts in {timeout:?}: {last}"
            )));
        }
        tracing::debug!(name, tries, error = %last, "retrying");
        tokio::select! {
            _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Call `attempt` up to `count` times, pausing `interval` after each failure.
/// Returns the first success or the last error.
pub async fn with_count<T, F, Fut>(
    cancel: &CancellationToken,
    count: u32,
    interval: Duration,
    name: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let count = count.max(1);
    let mut tries = 0u32;
    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(RecoveryError::Cancelled) => return Err(RecoveryError::Cancelled),
            Err(e) if tries >= count => return Err(e.context(format!("{name}: {tries} attempts"))),
            Err(e) => tracing::debug!(name, tries, error = %e, "retrying"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
