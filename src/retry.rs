//! Retry helpers for node and store calls.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

/// Run `op` up to `policy.attempts` times with a fixed sleep between attempts.
/// Errors for which `retryable` is false are returned immediately.
pub async fn simple<T, E, F, Fut>(
    policy: RetryConfig,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                tracing::debug!("retrying after attempt {}/{}: {}", attempt, attempts, e);
                tokio::time::sleep(policy.sleep()).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like `simple`, but the delay doubles after every attempt and carries random jitter.
pub async fn backoff<T, E, F, Fut>(
    policy: RetryConfig,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.sleep();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                let pause = with_jitter(delay);
                tracing::debug!("backing off {:?} after attempt {}/{}: {}", pause, attempt, attempts, e);
                tokio::time::sleep(pause).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Add up to half of `delay` again, chosen at random
fn with_jitter(delay: Duration) -> Duration {
    let max = delay.as_millis() as u64 / 2;
    if max == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}
