//! Rollout controller — executes a plan batch by batch.
//!
//! Each batch is one update request followed by a readiness gate. A batch
//! that does not become ready within the per-batch timeout halts the
//! rollout. Nothing is rolled back: the partial rollout stays in place
//! for the caller to inspect.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use rollwarden_core::config::OrchestratorConfig;
use rollwarden_core::{
    CancelToken, ControlError, PollTracker, RetryError, UpdateAck, WorkloadControl, WorkloadSpec,
    retry_call,
};
use rollwarden_health::{HealthError, HealthOutcome, HealthSettings, HealthTarget, HealthVerifier};

use crate::plan::RolloutPlan;

/// Current phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RolloutPhase {
    Pending,
    /// Update request for batch `current` of `total` issued, gate pending.
    RollingBatch { current: u32, total: u32 },
    Completed,
    Stalled { batch: u32 },
}

/// Why a batch stalled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StallCause {
    TimedOut,
    Unhealthy(String),
}

impl std::fmt::Display for StallCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StallCause::TimedOut => f.write_str("batch did not become ready in time"),
            StallCause::Unhealthy(detail) => f.write_str(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    Complete {
        final_replicas: u32,
    },
    Stalled {
        /// Last batch that became ready, if any.
        last_good_batch: Option<u32>,
        failed_batch: u32,
        cause: StallCause,
    },
}

#[derive(Debug, Clone, Error)]
pub enum RolloutError {
    #[error("update rejected: {0}")]
    Rejected(String),

    #[error("control API unavailable: {0}")]
    Cluster(ControlError),

    #[error("rollout cancelled")]
    Cancelled,
}

/// Progress bookkeeping for one plan.
#[derive(Debug, Clone)]
pub struct Rollout {
    pub plan: RolloutPlan,
    pub phase: RolloutPhase,
    last_good_batch: Option<u32>,
}

impl Rollout {
    pub fn new(plan: RolloutPlan) -> Self {
        Self {
            plan,
            phase: RolloutPhase::Pending,
            last_good_batch: None,
        }
    }

    fn start_batch(&mut self, current: u32) {
        let total = self.plan.total_batches();
        self.phase = RolloutPhase::RollingBatch { current, total };
        debug!(workload = %self.plan.workload, batch = current, total, "rolling batch");
    }

    fn batch_ready(&mut self, batch: u32) {
        self.last_good_batch = Some(batch);
        if batch >= self.plan.total_batches() {
            self.phase = RolloutPhase::Completed;
        }
    }

    fn stall(&mut self, batch: u32, cause: StallCause) -> RolloutOutcome {
        self.phase = RolloutPhase::Stalled { batch };
        RolloutOutcome::Stalled {
            last_good_batch: self.last_good_batch,
            failed_batch: batch,
            cause,
        }
    }

    pub fn last_good_batch(&self) -> Option<u32> {
        self.last_good_batch
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RolloutSettings {
    pub batch_timeout: Duration,
    pub restart_threshold: u32,
    pub poll_retries: u32,
    pub poll_backoff: Duration,
    pub health: HealthSettings,
}

impl RolloutSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            batch_timeout: config.rollout.batch_timeout,
            restart_threshold: config.health.restart_threshold,
            poll_retries: config.retry.poll_retries,
            poll_backoff: config.retry.poll_backoff,
            health: HealthSettings::from_config(&config.health, &config.retry),
        }
    }
}

pub struct RolloutController {
    control: Arc<dyn WorkloadControl>,
    verifier: HealthVerifier,
    settings: RolloutSettings,
}

impl RolloutController {
    pub fn new(control: Arc<dyn WorkloadControl>, settings: RolloutSettings) -> Self {
        let verifier = HealthVerifier::new(control.clone(), settings.health);
        Self {
            control,
            verifier,
            settings,
        }
    }

    /// Run every step of `rollout.plan`.
    pub async fn execute(
        &self,
        rollout: &mut Rollout,
        spec: &WorkloadSpec,
        cancel: &mut CancelToken,
    ) -> Result<RolloutOutcome, RolloutError> {
        let id = &spec.id;
        info!(
            workload = %id,
            image = %rollout.plan.image,
            target = rollout.plan.target_replicas,
            batches = rollout.plan.total_batches(),
            already_updated = rollout.plan.already_updated,
            "starting rollout"
        );

        let steps = rollout.plan.steps.clone();
        for step in &steps {
            if cancel.is_cancelled() {
                return Err(RolloutError::Cancelled);
            }
            rollout.start_batch(step.index);

            let update = rollout.plan.update_for(spec, step);
            let mut tracker = PollTracker::new(self.settings.poll_retries, self.settings.poll_backoff);
            let control = &self.control;
            let ack = retry_call(&mut tracker, cancel, ControlError::is_transient, || {
                control.apply_workload_update(id, &update)
            })
            .await
            .map_err(|e| match e {
                RetryError::Exhausted(e) => RolloutError::Cluster(e),
                RetryError::Cancelled => RolloutError::Cancelled,
            })?;
            if let UpdateAck::Rejected(reason) = ack {
                warn!(workload = %id, batch = step.index, %reason, "update rejected");
                return Err(RolloutError::Rejected(reason));
            }
            debug!(
                workload = %id,
                batch = step.index,
                surge = step.surge,
                unavailable = step.unavailable,
                updated = step.updated_after,
                "update accepted"
            );

            let target = HealthTarget {
                image: rollout.plan.image.clone(),
                revision: Some(rollout.plan.revision.clone()),
                ready_replicas: step.updated_after,
                restart_threshold: self.settings.restart_threshold,
            };
            let gate = self
                .verifier
                .wait_ready(id, &target, self.settings.batch_timeout, cancel)
                .await
                .map_err(|e| match e {
                    HealthError::Cancelled => RolloutError::Cancelled,
                    HealthError::Cluster(e) => RolloutError::Cluster(e),
                })?;

            match gate {
                HealthOutcome::Ready => {
                    info!(workload = %id, batch = step.index, total = steps.len(), "batch ready");
                    rollout.batch_ready(step.index);
                }
                HealthOutcome::TimedOut => {
                    warn!(
                        workload = %id,
                        batch = step.index,
                        timeout = ?self.settings.batch_timeout,
                        "batch timed out, halting rollout"
                    );
                    return Ok(rollout.stall(step.index, StallCause::TimedOut));
                }
                HealthOutcome::Unhealthy(detail) => {
                    warn!(workload = %id, batch = step.index, %detail, "batch unhealthy, halting rollout");
                    return Ok(rollout.stall(step.index, StallCause::Unhealthy(detail)));
                }
            }
        }

        info!(workload = %id, replicas = rollout.plan.target_replicas, "rollout completed");
        Ok(RolloutOutcome::Complete {
            final_replicas: rollout.plan.target_replicas,
        })
    }
}
