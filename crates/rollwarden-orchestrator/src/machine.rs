//! The orchestration state machine.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use rollwarden_autoscale::{AutoscaleError, AutoscaleMonitor, AutoscaleSettings, AutoscaleVerdict};
use rollwarden_core::config::{OrchestratorConfig, RetryConfig, format_duration};
use rollwarden_core::{
    AutoscaleObservation, CancelToken, ControlError, ImageReference, PollTracker, Registry,
    RetryError, WorkloadControl, WorkloadId, WorkloadSpec, WorkloadState, retry_call,
};
use rollwarden_health::{HealthError, HealthOutcome, HealthSettings, HealthTarget, HealthVerifier};
use rollwarden_registry::{ImageResolver, ResolveError};
use rollwarden_rollout::{
    Decision, Rollout, RolloutController, RolloutError, RolloutOutcome, RolloutPlan,
    RolloutSettings, detect,
};

use crate::attempt::{AttemptOutcome, AttemptRecord, Stage, StageStatus};
use crate::error::OrchestrationError;
use crate::lock::{AttemptLease, IdentityLocks, default_holder};
use crate::report::{DeploymentReport, Outcome, Warning};

/// States of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Idle,
    Resolving,
    Detecting,
    RollingOut,
    VerifyingHealth,
    MonitoringScale,
    Succeeded,
    SucceededWithWarning,
    Failed,
    Cancelled,
}

/// How one attempt ended, short of failure.
enum AttemptSuccess {
    NoChange,
    Stable { final_replicas: u32 },
    Warned { final_replicas: u32, warning: Warning },
}

/// Dry-run result: what `orchestrate` would do.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub workload: WorkloadId,
    pub resolved: ImageReference,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<RolloutPlan>,
}

/// Observed state of a workload, for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub workload: WorkloadId,
    pub state: WorkloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscale: Option<AutoscaleObservation>,
}

/// Backoff before attempt `next` (2-based): `initial × 2^(next-2)`,
/// capped at `max_backoff`.
pub fn retry_backoff(retry: &RetryConfig, next: u32) -> Duration {
    let exponent = next.saturating_sub(2).min(16);
    retry
        .initial_backoff
        .saturating_mul(1u32 << exponent)
        .min(retry.max_backoff)
}

pub struct Orchestrator {
    control: Arc<dyn WorkloadControl>,
    registry: Arc<dyn Registry>,
    locks: IdentityLocks,
    /// Name this orchestrator claims attempt leases under.
    holder: String,
}

/// Per-invocation bookkeeping: the current state and where it has been.
struct Run {
    id: WorkloadId,
    state: OrchestrationState,
    trail: Vec<OrchestrationState>,
}

impl Run {
    fn new(id: WorkloadId) -> Self {
        Self {
            id,
            state: OrchestrationState::Idle,
            trail: vec![OrchestrationState::Idle],
        }
    }

    fn transition(&mut self, next: OrchestrationState) {
        debug!(workload = %self.id, from = ?self.state, to = ?next, "state transition");
        self.state = next;
        self.trail.push(next);
    }
}

impl Orchestrator {
    pub fn new(control: Arc<dyn WorkloadControl>, registry: Arc<dyn Registry>) -> Self {
        Self {
            control,
            registry,
            locks: IdentityLocks::new(),
            holder: default_holder(),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Share an identity lock set with other orchestrators.
    pub fn with_locks(mut self, locks: IdentityLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    fn resolver(&self, config: &OrchestratorConfig) -> ImageResolver {
        ImageResolver::new(
            self.registry.clone(),
            config.retry.poll_retries,
            config.retry.poll_backoff,
        )
    }

    /// Run one orchestration to a terminal outcome.
    ///
    /// Returns `Err` only when the run never starts: invalid configuration,
    /// another attempt holding the identity in this process or its lease
    /// in the cluster, or a lease claim the control API kept failing.
    /// None of these issues a workload write.
    pub async fn orchestrate(
        &self,
        config: &OrchestratorConfig,
        mut cancel: CancelToken,
    ) -> Result<DeploymentReport, OrchestrationError> {
        config
            .validate()
            .map_err(|e| OrchestrationError::InvalidConfig(e.to_string()))?;

        let id = config.workload_id();
        let _guard = self.locks.try_acquire(&id)?;
        let lease =
            AttemptLease::claim(self.control.clone(), config, &id, &self.holder, &mut cancel).await?;
        let report = self.run(config, &id, &mut cancel).await;
        lease.release().await;
        Ok(report)
    }

    async fn run(
        &self,
        config: &OrchestratorConfig,
        id: &WorkloadId,
        cancel: &mut CancelToken,
    ) -> DeploymentReport {
        let mut run = Run::new(id.clone());
        let mut report = DeploymentReport {
            workload: id.clone(),
            requested: config.workload.image.clone(),
            resolved: None,
            outcome: Outcome::Cancelled,
            final_replicas: None,
            attempts: Vec::new(),
            trail: Vec::new(),
        };

        info!(workload = %id, image = %config.workload.image, "orchestration started");

        // Resolution happens once: every attempt deploys the same digest.
        run.transition(OrchestrationState::Resolving);
        let mut first = AttemptRecord::start(1);
        let spec = match self.resolve_spec(config, &mut first, cancel).await {
            Ok(spec) => spec,
            Err(e) => {
                let (state, attempt_outcome, outcome) = match e {
                    OrchestrationError::Cancelled => (
                        OrchestrationState::Cancelled,
                        AttemptOutcome::Cancelled,
                        Outcome::Cancelled,
                    ),
                    e => (
                        OrchestrationState::Failed,
                        AttemptOutcome::Failed,
                        Outcome::Failed(e),
                    ),
                };
                first.finalize(attempt_outcome);
                report.attempts.push(first);
                run.transition(state);
                report.outcome = outcome;
                return finish(report, run);
            }
        };
        report.resolved = Some(spec.image.clone());

        let max_attempts = config.retry.max_attempts;
        let mut first_failure: Option<Stage> = None;
        let mut first = Some(first);

        for number in 1..=max_attempts {
            let mut record = match first.take() {
                Some(record) => record,
                None => {
                    let mut record = AttemptRecord::start(number);
                    record.record(
                        Stage::Resolve,
                        StageStatus::Succeeded,
                        format!("reusing {}", spec.image),
                    );
                    record
                }
            };

            let result = self
                .run_attempt(config, &spec, &mut run, &mut record, cancel)
                .await;

            match result {
                Ok(success) => {
                    let (attempt_outcome, state, outcome, replicas) = match success {
                        AttemptSuccess::NoChange => (
                            AttemptOutcome::NoChangeNeeded,
                            OrchestrationState::Idle,
                            Outcome::NoChangeNeeded,
                            None,
                        ),
                        AttemptSuccess::Stable { final_replicas } => (
                            AttemptOutcome::Succeeded,
                            OrchestrationState::Succeeded,
                            Outcome::Succeeded,
                            Some(final_replicas),
                        ),
                        AttemptSuccess::Warned {
                            final_replicas,
                            warning,
                        } => (
                            AttemptOutcome::SucceededWithWarning,
                            OrchestrationState::SucceededWithWarning,
                            Outcome::SucceededWithWarning(warning),
                            Some(final_replicas),
                        ),
                    };
                    record.finalize(attempt_outcome);
                    report.attempts.push(record);
                    run.transition(state);
                    report.outcome = outcome;
                    report.final_replicas = replicas;
                    info!(workload = %id, attempt = number, outcome = %report.outcome, "orchestration finished");
                    return finish(report, run);
                }
                Err(OrchestrationError::Cancelled) => {
                    record.finalize(AttemptOutcome::Cancelled);
                    report.attempts.push(record);
                    run.transition(OrchestrationState::Cancelled);
                    report.outcome = Outcome::Cancelled;
                    warn!(workload = %id, attempt = number, "orchestration cancelled, partial rollout left in place");
                    return finish(report, run);
                }
                Err(e) => {
                    let attempt_outcome = match e {
                        OrchestrationError::TimedOut(_) => AttemptOutcome::TimedOut,
                        _ => AttemptOutcome::Failed,
                    };
                    first_failure = first_failure.or(record.failed_stage());
                    record.finalize(attempt_outcome);
                    report.attempts.push(record);
                    run.transition(OrchestrationState::Failed);

                    if !e.is_retryable() {
                        error!(workload = %id, attempt = number, error = %e, "attempt failed, not retrying");
                        report.outcome = Outcome::Failed(e);
                        return finish(report, run);
                    }
                    if number == max_attempts {
                        error!(workload = %id, attempts = number, error = %e, "retries exhausted");
                        report.outcome = Outcome::Failed(OrchestrationError::RetriesExhausted {
                            attempts: number,
                            first_failure: first_failure.unwrap_or(Stage::Detect),
                            last_error: Box::new(e),
                        });
                        return finish(report, run);
                    }

                    let backoff = retry_backoff(&config.retry, number + 1);
                    warn!(
                        workload = %id,
                        attempt = number,
                        max_attempts,
                        error = %e,
                        backoff = %format_duration(backoff),
                        "attempt failed, retrying"
                    );
                    if !cancel.sleep(backoff).await {
                        // The next attempt never got past its backoff.
                        let mut next = AttemptRecord::start(number + 1);
                        next.finalize(AttemptOutcome::Cancelled);
                        report.attempts.push(next);
                        run.transition(OrchestrationState::Cancelled);
                        report.outcome = Outcome::Cancelled;
                        warn!(workload = %id, attempt = number + 1, "orchestration cancelled during retry backoff");
                        return finish(report, run);
                    }
                }
            }
        }

        // `validate` guarantees at least one attempt, so the loop always
        // returns; this only guards against a zero limit slipping through.
        report.outcome = Outcome::Failed(OrchestrationError::InvalidConfig(
            "max_attempts must be at least 1".to_string(),
        ));
        finish(report, run)
    }

    async fn resolve_spec(
        &self,
        config: &OrchestratorConfig,
        record: &mut AttemptRecord,
        cancel: &mut CancelToken,
    ) -> Result<WorkloadSpec, OrchestrationError> {
        let requested = &config.workload.image;
        let pinned = match self.resolver(config).resolve(requested, cancel).await {
            Ok(pinned) => pinned,
            Err(ResolveError::Cancelled) => return Err(OrchestrationError::Cancelled),
            Err(e) => {
                let err = OrchestrationError::UnresolvableReference {
                    reference: requested.clone(),
                    reason: e.to_string(),
                };
                error!(reference = %requested, error = %e, "image resolution failed");
                record.fail(Stage::Resolve, &err);
                return Err(err);
            }
        };
        record.record(Stage::Resolve, StageStatus::Succeeded, format!("pinned {pinned}"));

        config.workload_spec(pinned).map_err(|e| {
            let err = OrchestrationError::InvalidConfig(e.to_string());
            record.fail(Stage::Resolve, &err);
            err
        })
    }

    async fn read_state(
        &self,
        config: &OrchestratorConfig,
        id: &WorkloadId,
        cancel: &mut CancelToken,
    ) -> Result<WorkloadState, OrchestrationError> {
        let mut tracker = PollTracker::new(config.retry.poll_retries, config.retry.poll_backoff);
        let control = &self.control;
        retry_call(&mut tracker, cancel, ControlError::is_transient, || {
            control.get_workload_state(id)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(e) => OrchestrationError::Cluster(e.to_string()),
            RetryError::Cancelled => OrchestrationError::Cancelled,
        })
    }

    async fn run_attempt(
        &self,
        config: &OrchestratorConfig,
        spec: &WorkloadSpec,
        run: &mut Run,
        record: &mut AttemptRecord,
        cancel: &mut CancelToken,
    ) -> Result<AttemptSuccess, OrchestrationError> {
        let id = &spec.id;
        let attempt = record.number;

        // ── Detecting ──────────────────────────────────────────────
        run.transition(OrchestrationState::Detecting);
        let state = self
            .read_state(config, id, cancel)
            .await
            .inspect_err(|e| record.fail(Stage::Detect, e))?;
        let reason = match detect(spec, &state) {
            Decision::NoChangeNeeded => {
                info!(workload = %id, attempt, "no change needed");
                record.record(Stage::Detect, StageStatus::Succeeded, "no change needed");
                return Ok(AttemptSuccess::NoChange);
            }
            Decision::RolloutRequired { reason } => reason,
        };
        info!(workload = %id, attempt, %reason, "rollout required");
        record.record(Stage::Detect, StageStatus::Succeeded, reason.to_string());

        // ── RollingOut ─────────────────────────────────────────────
        run.transition(OrchestrationState::RollingOut);
        let plan = RolloutPlan::derive(spec, &state);
        let target_replicas = plan.target_replicas;
        let revision = plan.revision.clone();
        let batches = plan.total_batches();
        let mut rollout = Rollout::new(plan);
        let controller = RolloutController::new(self.control.clone(), RolloutSettings::from_config(config));
        let outcome = controller
            .execute(&mut rollout, spec, cancel)
            .await
            .map_err(|e| match e {
                RolloutError::Cancelled => OrchestrationError::Cancelled,
                RolloutError::Rejected(reason) => OrchestrationError::UpdateRejected(reason),
                RolloutError::Cluster(e) => OrchestrationError::Cluster(e.to_string()),
            })
            .inspect_err(|e| {
                if *e != OrchestrationError::Cancelled {
                    record.fail(Stage::Rollout, e);
                }
            })?;
        let final_replicas = match outcome {
            RolloutOutcome::Complete { final_replicas } => final_replicas,
            RolloutOutcome::Stalled {
                last_good_batch,
                failed_batch,
                cause,
            } => {
                let err = OrchestrationError::RolloutStalled {
                    last_good_batch,
                    failed_batch,
                    cause,
                };
                record.fail(Stage::Rollout, &err);
                return Err(err);
            }
        };
        record.record(
            Stage::Rollout,
            StageStatus::Succeeded,
            format!("{batches} batch(es), {final_replicas} replica(s)"),
        );

        // ── VerifyingHealth ────────────────────────────────────────
        run.transition(OrchestrationState::VerifyingHealth);
        let verifier = HealthVerifier::new(
            self.control.clone(),
            HealthSettings::from_config(&config.health, &config.retry),
        );
        let target = HealthTarget {
            image: spec.image.clone(),
            revision: Some(revision),
            ready_replicas: target_replicas,
            restart_threshold: config.health.restart_threshold,
        };
        let health = verifier
            .wait_ready(id, &target, config.health.deadline, cancel)
            .await
            .map_err(|e| match e {
                HealthError::Cancelled => OrchestrationError::Cancelled,
                HealthError::Cluster(e) => OrchestrationError::Cluster(e.to_string()),
            })
            .inspect_err(|e| {
                if *e != OrchestrationError::Cancelled {
                    record.fail(Stage::Health, e);
                }
            })?;
        match health {
            HealthOutcome::Ready => {
                record.record(
                    Stage::Health,
                    StageStatus::Succeeded,
                    format!("{target_replicas} replica(s) ready"),
                );
            }
            HealthOutcome::Unhealthy(detail) => {
                let err = OrchestrationError::Unhealthy(detail);
                record.fail(Stage::Health, &err);
                return Err(err);
            }
            HealthOutcome::TimedOut => {
                let err = OrchestrationError::TimedOut(config.health.deadline);
                record.fail(Stage::Health, &err);
                return Err(err);
            }
        }

        // ── MonitoringScale ────────────────────────────────────────
        run.transition(OrchestrationState::MonitoringScale);
        let monitor = AutoscaleMonitor::new(
            self.control.clone(),
            AutoscaleSettings::from_config(&config.autoscale, &config.retry),
        );
        let verdict = monitor.confirm(id, cancel).await.map_err(|e| match e {
            AutoscaleError::Cancelled => OrchestrationError::Cancelled,
        })?;
        match verdict {
            AutoscaleVerdict::Stable {
                utilization,
                replicas,
            } => {
                record.record(
                    Stage::Autoscale,
                    StageStatus::Succeeded,
                    format!("stable at {utilization}% with {replicas} replica(s)"),
                );
                Ok(AttemptSuccess::Stable { final_replicas })
            }
            AutoscaleVerdict::Elevated {
                utilization,
                projected_replicas,
            } => {
                let warning = Warning::Elevated {
                    utilization,
                    projected_replicas,
                };
                warn!(workload = %id, %warning, "autoscaler not settled");
                record.record(Stage::Autoscale, StageStatus::Warning, warning.to_string());
                Ok(AttemptSuccess::Warned {
                    final_replicas,
                    warning,
                })
            }
            AutoscaleVerdict::MetricsUnavailable { waited } => {
                let soft = OrchestrationError::MetricsUnavailable(waited);
                warn!(workload = %id, error = %soft, "continuing without autoscaler confirmation");
                record.record(Stage::Autoscale, StageStatus::Warning, soft.to_string());
                Ok(AttemptSuccess::Warned {
                    final_replicas,
                    warning: Warning::MetricsUnavailable { waited },
                })
            }
        }
    }

    /// Resolve and detect without writing anything.
    pub async fn plan(
        &self,
        config: &OrchestratorConfig,
        mut cancel: CancelToken,
    ) -> Result<PlanReport, OrchestrationError> {
        config
            .validate()
            .map_err(|e| OrchestrationError::InvalidConfig(e.to_string()))?;
        let mut scratch = AttemptRecord::start(1);
        let spec = self.resolve_spec(config, &mut scratch, &mut cancel).await?;
        let state = self.read_state(config, &spec.id, &mut cancel).await?;
        let decision = detect(&spec, &state);
        let plan = decision
            .rollout_required()
            .then(|| RolloutPlan::derive(&spec, &state));
        Ok(PlanReport {
            workload: spec.id.clone(),
            resolved: spec.image.clone(),
            decision,
            plan,
        })
    }

    /// Current workload state and autoscaler snapshot.
    pub async fn status(
        &self,
        config: &OrchestratorConfig,
        mut cancel: CancelToken,
    ) -> Result<StatusReport, OrchestrationError> {
        let id = config.workload_id();
        let state = self.read_state(config, &id, &mut cancel).await?;
        let autoscale = match self.control.get_autoscale_observation(&id).await {
            Ok(obs) => Some(obs),
            Err(e) => {
                debug!(workload = %id, error = %e, "no autoscaler observation");
                None
            }
        };
        Ok(StatusReport {
            workload: id,
            state,
            autoscale,
        })
    }
}

fn finish(mut report: DeploymentReport, run: Run) -> DeploymentReport {
    report.trail = run.trail;
    report
}
