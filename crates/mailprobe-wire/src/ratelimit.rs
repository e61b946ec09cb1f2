//! Token-bucket gate in front of every wire operation.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Shared token-bucket rate limiter.
///
/// Cloning shares the bucket, so one limiter can govern several concurrent
/// sessions. A limiter built with a rate `<= 0` admits everything.
#[derive(Clone, Default)]
pub struct RateLimiter {
    bucket: Option<Arc<DefaultDirectRateLimiter>>,
    rate: f64,
}

impl RateLimiter {
    /// Creates a limiter admitting `per_second` operations per second on average.
    ///
    /// Bursts up to `ceil(per_second)` operations are allowed.
    #[must_use]
    pub fn new(per_second: f64) -> Self {
        if !per_second.is_finite() || per_second <= 0.0 {
            return Self::disabled();
        }

        let period = Duration::from_secs_f64(1.0 / per_second);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let burst = NonZeroU32::new(per_second.ceil().min(f64::from(u32::MAX)) as u32)
            .unwrap_or(NonZeroU32::MIN);

        match Quota::with_period(period) {
            Some(quota) => Self {
                bucket: Some(Arc::new(DefaultDirectRateLimiter::direct(
                    quota.allow_burst(burst),
                ))),
                rate: per_second,
            },
            None => Self::disabled(),
        }
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            bucket: None,
            rate: 0.0,
        }
    }

    /// Returns true if limiting is active.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Returns the configured rate in operations per second.
    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// Waits for a token.
    ///
    /// Only the calling operation is suspended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(bucket) = &self.bucket else {
            return if cancel.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            };
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = bucket.until_ready() => Ok(()),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.is_enabled())
            .field("rate", &self.rate)
            .finish()
    }
}
