use log::warn;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last:#}")]
pub struct RetryError {
    pub attempts: usize,
    pub last: anyhow::Error,
}

/// Runs `op` until it succeeds or `max_attempts` calls have been made,
/// sleeping `delay` between attempts. Every error is treated the same way.
/// `max_attempts` of zero is treated as one.
pub async fn retry_fixed<T, F, Fut>(
    max_attempts: usize,
    delay: Duration,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => {
                warn!(
                    "Attempt {}/{} failed: {:#}, retrying in {:?}...",
                    attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
