use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Run `op` up to `max_retries + 1` times, sleeping `base_delay * 2^attempt`
/// between failures. The last error is returned once retries run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut op: F,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                let delay = exponential_delay(base_delay, attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// `base * 2^attempt`, saturating instead of overflowing.
pub fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}
