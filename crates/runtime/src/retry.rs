//! Retry and backoff helpers.
//!
//! Admin job submission and polling run under [`run_with_retry`] with a
//! linear backoff; transient storage reads use [`backoff_with_jitter`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry policy: `max_retries` attempts with delay `base_delay × attempt`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the 1-based attempt that just
    /// failed. Linear: `base_delay × attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Run `f` up to `policy.max_retries` times, sleeping the linear backoff
/// between attempts. Returns the last error on exhaustion.
///
/// `name` is the operation label surfaced in structured logs.
pub async fn run_with_retry<T, E, F, Fut>(
    name: &str,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = name,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::warn!(
                    operation = name,
                    attempt,
                    error = %err,
                    "operation failed, retries exhausted"
                );
                return Err(err);
            }
        }
    }
}

/// Exponential backoff with uniform jitter, capped at 60 seconds.
///
/// Attempt is 1-based; attempt 1 yields `base .. 1.5×base`.
pub fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    const CAP: Duration = Duration::from_secs(60);
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
    capped + Duration::from_millis(jitter_ms)
}
