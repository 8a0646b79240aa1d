//! Bounded retry with exponential backoff.
//!
//! Only errors for which [`Error::is_retryable`](crate::error::Error::is_retryable)
//! holds are retried; anything else is returned on first occurrence.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry bounds for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per step, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    ///
    /// `base * 2^(failures-1)`, capped at `max_delay`.
    ///
    /// ```
    /// use password_sentinel::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy {
    ///     max_attempts: 5,
    ///     base_delay: Duration::from_secs(1),
    ///     max_delay: Duration::from_secs(5),
    /// };
    /// assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    /// assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    /// assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    /// ```
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Sum of every delay a fully exhausted step sleeps through.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_for(n)).sum()
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the policy is exhausted.
///
/// `budget_used` is the number of failures already spent (for example restored
/// from persistent state after a restart); `on_failure` is told about every
/// transient failure before the backoff sleep, and may veto further retries
/// by returning an error (used to persist the counter).
///
/// Returns the last error once the bound is reached.
pub(crate) async fn retry_transient<T, Op, Fut, Hook, HookFut>(
    policy: &RetryPolicy,
    label: &str,
    budget_used: u32,
    mut op: Op,
    mut on_failure: Hook,
) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    Hook: FnMut(u32) -> HookFut,
    HookFut: Future<Output = Result<()>>,
{
    let mut failures = budget_used;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                failures += 1;
                on_failure(failures).await?;

                if failures >= policy.max_attempts {
                    warn!(
                        step = label,
                        failures,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for(failures);
                warn!(
                    step = label,
                    failures,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Convenience wrapper without persistence hook.
#[cfg(test)]
pub(crate) async fn retry_simple<T, Op, Fut>(policy: &RetryPolicy, label: &str, op: Op) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_transient(policy, label, 0, op, |_| async { Ok(()) }).await
}
