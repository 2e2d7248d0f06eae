use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tracing::warn;

pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// Fixed backoff schedule: one delay per retry, no jitter.
///
/// A policy with `n` delays makes at most `n + 1` attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_RETRY_DELAYS_SECS)
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(delays_secs: &[u64]) -> Self {
        Self::new(delays_secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn no_retries() -> Self {
        Self::new(Vec::new())
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Delay to wait after the `failed_attempt`-th (1-based) attempt failed,
    /// or `None` once the schedule is exhausted.
    pub fn delay_after(&self, failed_attempt: usize) -> Option<Duration> {
        failed_attempt
            .checked_sub(1)
            .and_then(|index| self.delays.get(index))
            .copied()
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// The last error seen by [`retry_with_policy`] and how many attempts were made.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: usize,
    pub last: E,
}

pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = if is_retryable(&err) {
                    policy.delay_after(attempt)
                } else {
                    None
                };
                let Some(delay) = delay else {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: err,
                    });
                };
                warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failed attempt"
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
