//! Stage-level retry for individual cluster/registry calls.
//!
//! This absorbs flakiness (a single failed poll) within one stage. It is
//! deliberately separate from the attempt-level retry in the orchestrator,
//! which handles genuine rollout failure.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancelToken;

/// Tracks consecutive call failures for one stage.
#[derive(Debug, Clone)]
pub struct PollTracker {
    consecutive_failures: u32,
    /// Failures tolerated before escalating.
    max_failures: u32,
    current_backoff: Duration,
    base_backoff: Duration,
    max_backoff: Duration,
}

/// What to do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Escalate,
}

impl PollTracker {
    pub fn new(max_failures: u32, base_backoff: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            max_failures,
            current_backoff: base_backoff,
            base_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// A successful call resets the failure streak and the backoff.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(failures = self.consecutive_failures, "call recovered");
        }
        self.consecutive_failures = 0;
        self.current_backoff = self.base_backoff;
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.max_failures {
            return RetryDecision::Escalate;
        }
        let wait = self.current_backoff;
        // Exponential backoff: double the interval up to max.
        self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
        RetryDecision::RetryAfter(wait)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Why a retried call gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The failure streak exceeded the tracker's limit; carries the last error.
    Exhausted(E),
    Cancelled,
}

/// Run `op` until it succeeds, the tracker escalates, `is_transient`
/// rejects an error, or the caller cancels.
pub async fn retry_call<T, E, F, Fut>(
    tracker: &mut PollTracker,
    cancel: &mut CancelToken,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => {
                tracker.record_success();
                return Ok(value);
            }
            Err(e) if !is_transient(&e) => return Err(RetryError::Exhausted(e)),
            Err(e) => match tracker.record_failure() {
                RetryDecision::RetryAfter(wait) => {
                    debug!(error = %e, failures = tracker.consecutive_failures(), ?wait, "retrying call");
                    if !cancel.sleep(wait).await {
                        return Err(RetryError::Cancelled);
                    }
                }
                RetryDecision::Escalate => {
                    warn!(error = %e, failures = tracker.consecutive_failures(), "giving up on call");
                    return Err(RetryError::Exhausted(e));
                }
            },
        }
    }
}
