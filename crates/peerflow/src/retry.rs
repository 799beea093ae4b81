// Shared retry-with-backoff: exponential delay, jitter, max-delay cap.

use crate::error::EngineError;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry behavior for a class of operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry attempts beyond the initial one.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `base * 2^n` plus jitter.
    pub base_delay: Duration,
    /// Hard cap on any computed delay.
    pub max_delay: Duration,
    /// Adds up to `base/2` of random jitter to spread retries.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after 0-indexed `attempt`. Works in whole
    /// milliseconds with saturating arithmetic so pathological attempt
    /// counts or sub-millisecond bases cannot overflow or underflow.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let doubling = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let mut delay_ms = base_ms.saturating_mul(doubling).min(cap_ms);

        if self.jitter {
            // Spread retries by up to half the base, never past the cap.
            let spread_ms = (base_ms / 2).min(cap_ms - delay_ms);
            if spread_ms > 0 {
                delay_ms += rand::rng().random_range(0..spread_ms);
            }
        }
        Duration::from_millis(delay_ms)
    }
}

/// Outcome of a single attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure; retry if attempts remain.
    Retry(EngineError),
    /// Permanent failure; stop immediately.
    Fail(EngineError),
}

/// Run `operation` under `policy`, sleeping between retryable failures. The
/// closure receives the 0-indexed attempt number. Cancellation short-circuits
/// both the attempt gate and the backoff sleep.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, EngineError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut last_err = None;
    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                last_err = Some(err);
                tokio::select! {
                    _ = token.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::internal("retry loop exited without result")))
}
