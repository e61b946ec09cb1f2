//! Exponential backoff around fallible wire operations.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Upper bound for a single backoff wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry policy with exponential backoff.
///
/// The first attempt always runs; up to `max_retries` further attempts follow
/// when the error is retryable. The wait before retry `n` (zero based) is
/// `base_delay * 2^n`, capped at [`MAX_BACKOFF`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Returns the wait before retry number `attempt` (zero based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
    }

    /// Runs `op` until it succeeds, fails fatally, or retries run out.
    ///
    /// Cancellation during a backoff wait returns [`Error::Cancelled`] instead of
    /// the last operation error.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error unchanged, or
    /// [`Error::RetriesExhausted`] wrapping the last error.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancelled() || !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_retries {
                if self.max_retries == 0 {
                    return Err(err);
                }
                return Err(Error::RetriesExhausted {
                    retries: self.max_retries,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(attempt = attempt + 1, ?delay, error = %err, "retrying after transient failure");

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
