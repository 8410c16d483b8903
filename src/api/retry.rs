//! Per-entity retry context: the fetch state machine and the logging helpers
//! that keep retry instrumentation consistent.

use anyhow::Error;
use std::time::Duration;

/// States a single entity fetch moves through.
///
/// `Pending` is initial; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    Requesting,
    Backoff,
    Done,
    Failed,
}

/// Inputs that drive [`FetchState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchEvent {
    Dispatch,
    Success,
    RateLimited,
    RetriesExhausted,
    OtherError,
    BackoffElapsed,
    Cancelled,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Done | FetchState::Failed)
    }

    /// Applies `event`; events that do not apply to the current state leave it unchanged.
    pub fn on(self, event: FetchEvent) -> FetchState {
        match (self, event) {
            (FetchState::Pending, FetchEvent::Dispatch) => FetchState::Requesting,
            (FetchState::Requesting, FetchEvent::Success) => FetchState::Done,
            (FetchState::Requesting, FetchEvent::RateLimited) => FetchState::Backoff,
            (FetchState::Requesting, FetchEvent::RetriesExhausted)
            | (FetchState::Requesting, FetchEvent::OtherError) => FetchState::Failed,
            (FetchState::Backoff, FetchEvent::BackoffElapsed) => FetchState::Requesting,
            (state, FetchEvent::Cancelled) if !state.is_terminal() => FetchState::Failed,
            (state, _) => state,
        }
    }
}

/// Logging context for one entity fetch.
#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    entity: &'a str,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(entity: &'a str) -> Self {
        Self { entity }
    }

    pub(crate) fn log_transition(&self, from: FetchState, to: FetchState) {
        if from != to {
            tracing::trace!(entity = self.entity, from = ?from, to = ?to, "fetch state transition");
        }
    }

    pub(crate) fn log_rate_limited(&self, attempt: usize, retries_left: usize, backoff: Duration) {
        tracing::warn!(
            entity = self.entity,
            attempt,
            retries_left,
            backoff_ms = Self::duration_to_millis(backoff),
            "rate limited; retrying after backoff"
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize) {
        tracing::error!(
            entity = self.entity,
            attempt,
            "still rate limited after final retry"
        );
    }

    pub(crate) fn log_failure(&self, attempt: usize, err: &Error) {
        tracing::error!(
            entity = self.entity,
            attempt,
            error = %err,
            "document request failed"
        );
    }

    pub(crate) fn log_completed(&self, attempt: usize, cells: usize, malformed: usize) {
        tracing::debug!(
            entity = self.entity,
            attempt,
            cells,
            malformed_cells = malformed,
            "document fetched"
        );
    }

    fn duration_to_millis(backoff: Duration) -> u64 {
        backoff.as_millis().min(u128::from(u64::MAX)) as u64
    }
}
