use std::{future::Future, time::Duration};

use rand::Rng;

/// Exponential backoff with optional jitter, bounded by `min_delay` and
/// `max_delay`. Error-type agnostic: the caller supplies the retry predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
    /// ±30% randomization of each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(3000),
            factor: 2,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (1-based). Without jitter this is exactly
    /// `min_delay * factor^(n-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = u64::from(self.factor).saturating_pow(exp);
        let base = self
            .min_delay
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .min(self.max_delay);
        if !self.jitter {
            return base;
        }
        let base_ms = base.as_millis() as u64;
        let spread = base_ms * 3 / 10;
        let jittered = rand::thread_rng().gen_range(base_ms.saturating_sub(spread)..=base_ms + spread);
        // Jitter never escapes the configured bounds.
        Duration::from_millis(jittered).clamp(self.min_delay, self.max_delay)
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `should_retry`
/// declines. The first attempt does not count as a retry, so `op` runs at
/// most `retries + 1` times.
pub async fn retry_with_policy<T, E, Fut, Op, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut op: Op,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    Op: FnMut() -> Fut,
    P: Fn(&E, u32) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt > policy.retries || !should_retry(&error, attempt) {
                    return Err(error);
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
