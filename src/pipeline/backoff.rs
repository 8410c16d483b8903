//! Wait policies applied between rate-limited attempts, plus a sleep that
//! wakes up early when the batch is abandoned.

use anyhow::Result;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::api::client::FetchError;

const DEFAULT_FIXED_DELAY_MS: u64 = 1_000;
const DEFAULT_EXPONENTIAL_MAX_MS: u64 = 60_000;

/// How long to wait before each retry of a rate-limited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same wait before every retry.
    Fixed { delay: Duration },
    /// Wait starts at `initial` and doubles on each retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed {
            delay: Duration::from_millis(DEFAULT_FIXED_DELAY_MS),
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed { delay }
    }

    pub fn exponential(initial: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial,
            max: Duration::from_millis(DEFAULT_EXPONENTIAL_MAX_MS),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: usize) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay } => delay,
            BackoffPolicy::Exponential { initial, max } => {
                if retry <= 1 {
                    return initial.min(max);
                }

                let exponent = retry.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
                initial.saturating_mul(multiplier).min(max)
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match *self {
            BackoffPolicy::Fixed { .. } => Ok(()),
            BackoffPolicy::Exponential { initial, max } => {
                if initial.is_zero() {
                    anyhow::bail!("exponential backoff initial delay must be greater than 0");
                }
                if max < initial {
                    anyhow::bail!("exponential backoff max delay must not be below the initial delay");
                }
                Ok(())
            }
        }
    }
}

/// Sleeps for `delay`, returning [`FetchError::Cancelled`] if `cancellation` fires first.
pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: &CancellationToken,
) -> Result<()> {
    if cancellation.is_cancelled() {
        return Err(FetchError::Cancelled.into());
    }

    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    tokio::select! {
        _ = cancellation.cancelled() => Err(FetchError::Cancelled.into()),
        _ = sleep(delay) => Ok(()),
    }
}
