//! Knobs for the retrying document client along with validation so callers
//! can reason about timeouts and the rate-limit retry budget.

use crate::pipeline::backoff::BackoffPolicy;
use anyhow::{bail, Result};
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Upper bound for a single request, including reading the body.
    pub request_timeout: Duration,
    /// Retries allowed after the first rate-limited request.
    pub max_retries: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.max_retries == 0 {
            bail!("max_retries must be greater than 0");
        }
        self.backoff.validate()
    }
}
