use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::ProviderError;

pub const DEFAULT_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 300;
const MAX_DELAY_MS: u64 = 5_000;

/// Run `op` up to `attempts` times, sleeping with jittered exponential
/// backoff between transient failures. Non-retryable errors return
/// immediately.
pub async fn retry_with_backoff<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying provider call");
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                tracing::warn!(attempt, error = %err, "transient provider failure");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| ProviderError::Transient("retry budget exhausted".into())))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY_MS.saturating_mul(1 << attempt.min(4));
    let capped = exp.min(MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped / 2 + jitter)
}
