//! Retry with exponential backoff for leader reads and follower writes.
//!
//! Only transient errors are retried. Backoff sleeps observe a cancellation
//! token so a pause or stop never waits out a long retry loop.

use std::future::Future;
use std::time::Duration;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Retry policy threaded through the fetcher and applier
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Delay cap
    pub max_backoff: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), without jitter.
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let computed = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = computed.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay after the given failed attempt, with jitter when enabled
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() as u64 / 4).max(1);
        let extra = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(extra)).min(self.max_backoff.max(base))
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// attempt budget, or `cancel` fires during a backoff sleep.
    ///
    /// `on_failure` sees every failed attempt, retried or not.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut on_failure: impl FnMut(&Error),
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            on_failure(&err);

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                tracing::error!(
                    "{} failed after {} attempts, giving up: {}",
                    operation_name,
                    attempt,
                    err
                );
                return Err(Error::RetriesExhausted {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                "{} failed (attempt {}/{}): {} - retrying in {:?}",
                operation_name,
                attempt,
                self.max_attempts,
                err,
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
