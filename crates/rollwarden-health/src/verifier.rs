//! Readiness polling loop.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rollwarden_core::config::{HealthConfig, RetryConfig};
use rollwarden_core::{
    CancelToken, ControlError, PollTracker, RetryError, WorkloadControl, WorkloadId, retry_call,
};

use crate::checker::{Assessment, HealthTarget, assess};

/// Result of one verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Ready,
    Unhealthy(String),
    TimedOut,
}

#[derive(Debug, Clone, Error)]
pub enum HealthError {
    #[error("health verification cancelled")]
    Cancelled,

    /// State reads kept failing past the stage-level retry budget.
    #[error("workload state unavailable: {0}")]
    Cluster(ControlError),
}

/// Polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub interval: Duration,
    pub poll_retries: u32,
    pub poll_backoff: Duration,
}

impl HealthSettings {
    pub fn from_config(health: &HealthConfig, retry: &RetryConfig) -> Self {
        Self {
            interval: health.interval,
            poll_retries: retry.poll_retries,
            poll_backoff: retry.poll_backoff,
        }
    }
}

pub struct HealthVerifier {
    control: Arc<dyn WorkloadControl>,
    settings: HealthSettings,
}

impl HealthVerifier {
    pub fn new(control: Arc<dyn WorkloadControl>, settings: HealthSettings) -> Self {
        Self { control, settings }
    }

    /// Poll until `target` is met, a replica crash-loops, or `deadline`
    /// elapses.
    pub async fn wait_ready(
        &self,
        id: &WorkloadId,
        target: &HealthTarget,
        deadline: Duration,
        cancel: &mut CancelToken,
    ) -> Result<HealthOutcome, HealthError> {
        let started = Instant::now();
        let deadline_at = started + deadline;
        let mut tracker = PollTracker::new(self.settings.poll_retries, self.settings.poll_backoff);
        let mut polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(HealthError::Cancelled);
            }

            let control = &self.control;
            let read = retry_call(&mut tracker, cancel, ControlError::is_transient, || {
                control.get_workload_state(id)
            });
            let state = match tokio::time::timeout_at(deadline_at, read).await {
                Ok(Ok(state)) => state,
                Ok(Err(RetryError::Cancelled)) => return Err(HealthError::Cancelled),
                Ok(Err(RetryError::Exhausted(e))) => return Err(HealthError::Cluster(e)),
                Err(_) => {
                    warn!(workload = %id, "health deadline elapsed during state read");
                    return Ok(HealthOutcome::TimedOut);
                }
            };
            polls += 1;

            match assess(&state, target) {
                Assessment::Ready => {
                    info!(
                        workload = %id,
                        ready = target.ready_replicas,
                        polls,
                        elapsed = ?started.elapsed(),
                        "replicas ready"
                    );
                    return Ok(HealthOutcome::Ready);
                }
                Assessment::CrashLoop { replica, restarts } => {
                    warn!(workload = %id, %replica, restarts, "replica is crash-looping");
                    return Ok(HealthOutcome::Unhealthy(format!(
                        "replica {replica} restarted {restarts} times without becoming ready"
                    )));
                }
                Assessment::NotReadyYet { ready, expected } => {
                    let now = Instant::now();
                    if now >= deadline_at {
                        warn!(workload = %id, ready, expected, ?deadline, "replicas not ready before deadline");
                        return Ok(HealthOutcome::TimedOut);
                    }
                    debug!(workload = %id, ready, expected, "waiting for replicas");
                    let wait = self.settings.interval.min(deadline_at - now);
                    if !cancel.sleep(wait).await {
                        return Err(HealthError::Cancelled);
                    }
                }
            }
        }
    }
}
