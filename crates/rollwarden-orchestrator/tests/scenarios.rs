//! End-to-end orchestration against the simulated cluster.

use std::sync::Arc;
use std::time::Duration;

use rollwarden_core::sim::{ReplicaBehavior, SimulatedCluster};
use rollwarden_core::*;
use rollwarden_orchestrator::*;
use rollwarden_rollout::{Decision, StallCause};
use tokio::time::Instant;

const REFERENCE: &str = "ghcr.io/acme/app:v2";

fn digest(fill: char) -> Digest {
    Digest::parse(&format!("sha256:{}", fill.to_string().repeat(64))).unwrap()
}

fn old_image() -> ImageReference {
    ImageReference::parse("ghcr.io/acme/app:v1")
        .unwrap()
        .pinned(digest('a'))
}

fn new_image() -> ImageReference {
    ImageReference::parse(REFERENCE).unwrap().pinned(digest('b'))
}

fn config(replicas: u32, max_unavailable: &str, max_surge: &str) -> OrchestratorConfig {
    let toml = format!(
        r#"
[workload]
name = "app"
namespace = "web"
image = "{REFERENCE}"

[workload.replicas]
min = {replicas}
max = {replicas}

[rollout]
max_unavailable = "{max_unavailable}"
max_surge = "{max_surge}"
batch_timeout = "30s"

[health]
interval = "2s"
deadline = "60s"
restart_threshold = 3

[autoscale]
sample_interval = "5s"
window = "30s"
metrics_grace = "20s"
stable_samples = 2

[retry]
max_attempts = 3
initial_backoff = "1s"
max_backoff = "10s"
poll_retries = 3
poll_backoff = "200ms"
"#
    );
    OrchestratorConfig::from_toml(&toml).unwrap()
}

/// A cluster running `replicas` of the old image, with v2 published.
fn cluster(replicas: u32) -> Arc<SimulatedCluster> {
    let sim = Arc::new(SimulatedCluster::new());
    sim.publish(REFERENCE, &digest('b'));
    sim.seed_workload(&WorkloadId::new("web", "app"), &old_image(), replicas, None);
    sim
}

fn orchestrator(sim: &Arc<SimulatedCluster>) -> Orchestrator {
    Orchestrator::new(sim.clone(), sim.clone())
}

async fn deploy(orch: &Orchestrator, cfg: &OrchestratorConfig) -> DeploymentReport {
    orch.orchestrate(cfg, CancelToken::never()).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn clean_deploy_surges_then_replaces() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.final_replicas, Some(1));
    assert_eq!(report.resolved, Some(new_image()));
    assert_eq!(sim.writes(), 1);
    let update = &sim.updates()[0];
    assert_eq!(update.surge, 1);
    assert_eq!(update.updated_replicas, 1);
    assert_eq!(sim.peak_unavailable(&report.workload), 0);

    let state = sim.snapshot(&report.workload);
    assert_eq!(state.replicas.len(), 1);
    assert!(state.replicas[0].image.same_artifact(&new_image()));
    assert_eq!(
        report.trail,
        vec![
            OrchestrationState::Idle,
            OrchestrationState::Resolving,
            OrchestrationState::Detecting,
            OrchestrationState::RollingOut,
            OrchestrationState::VerifyingHealth,
            OrchestrationState::MonitoringScale,
            OrchestrationState::Succeeded,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn second_run_is_a_no_op() {
    let sim = cluster(3);
    let cfg = config(3, "1", "1");
    let orch = orchestrator(&sim);

    assert_eq!(deploy(&orch, &cfg).await.outcome, Outcome::Succeeded);
    let writes = sim.writes();

    let again = deploy(&orch, &cfg).await;
    assert_eq!(again.outcome, Outcome::NoChangeNeeded);
    assert_eq!(sim.writes(), writes);
    assert_eq!(again.attempts.len(), 1);
    assert_eq!(again.attempts[0].outcome, AttemptOutcome::NoChangeNeeded);
    assert_eq!(again.trail.last(), Some(&OrchestrationState::Idle));
}

#[tokio::test(start_paused = true)]
async fn identical_reference_and_spec_writes_nothing() {
    let cfg = config(2, "1", "1");
    let spec = cfg.workload_spec(new_image()).unwrap();
    let sim = Arc::new(SimulatedCluster::new());
    sim.publish(REFERENCE, &digest('b'));
    sim.seed_workload(&spec.id, &new_image(), 2, Some(RevisionMarker::compute(&spec)));

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert_eq!(report.outcome, Outcome::NoChangeNeeded);
    assert_eq!(sim.writes(), 0);
    assert_eq!(report.final_replicas, None);
}

#[tokio::test(start_paused = true)]
async fn unavailable_replicas_stay_within_budget() {
    for (replicas, fraction, surge) in [(4, "25%", "0"), (10, "30%", "0"), (5, "40%", "20%")] {
        let sim = cluster(replicas);
        let cfg = config(replicas, fraction, surge);

        let report = deploy(&orchestrator(&sim), &cfg).await;
        assert_eq!(report.outcome, Outcome::Succeeded, "{replicas} replicas at {fraction}");

        let budget = cfg.rollout.max_unavailable.resolve(replicas);
        let peak = sim.peak_unavailable(&report.workload);
        assert!(
            peak <= budget,
            "{replicas} replicas at {fraction}: peak {peak} over budget {budget}"
        );
        assert!(sim.updates().iter().all(|u| u.surge <= cfg.rollout.max_surge.resolve(replicas)));
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_rollout_exhausts_retries() {
    let sim = cluster(1);
    sim.set_behavior(&new_image(), ReplicaBehavior::NeverReady);
    let mut cfg = config(1, "0", "1");
    cfg.rollout.batch_timeout = Duration::from_secs(10);

    let report = deploy(&orchestrator(&sim), &cfg).await;

    match report.error() {
        Some(OrchestrationError::RetriesExhausted {
            attempts,
            first_failure,
            last_error,
        }) => {
            assert_eq!(*attempts, 3);
            assert_eq!(*first_failure, Stage::Rollout);
            assert!(matches!(
                **last_error,
                OrchestrationError::RolloutStalled {
                    last_good_batch: None,
                    failed_batch: 1,
                    cause: StallCause::TimedOut,
                }
            ));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(report.attempts.len(), 3);
    assert!(report.attempts.iter().all(|a| a.outcome == AttemptOutcome::Failed));
    assert!(report.attempts.iter().all(|a| a.failed_stage() == Some(Stage::Rollout)));
    assert_eq!(report.failed_stage(), Some(Stage::Rollout));
    assert_eq!(report.last_completed_stage(), Some(Stage::Detect));
    assert_eq!(sim.writes(), 3);
    // Old replica keeps serving; nothing is rolled back.
    assert_eq!(sim.snapshot(&report.workload).ready_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn crash_loop_fails_well_before_batch_timeout() {
    let sim = cluster(2);
    sim.set_behavior(&new_image(), ReplicaBehavior::CrashLoop);
    let mut cfg = config(2, "1", "1");
    cfg.rollout.batch_timeout = Duration::from_secs(120);

    let started = Instant::now();
    let report = deploy(&orchestrator(&sim), &cfg).await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(120), "took {elapsed:?}");
    match report.error() {
        Some(OrchestrationError::RetriesExhausted { last_error, .. }) => {
            assert!(matches!(
                **last_error,
                OrchestrationError::RolloutStalled {
                    cause: StallCause::Unhealthy(_),
                    ..
                }
            ));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn held_identity_is_rejected_without_writes() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");
    let orch = orchestrator(&sim);

    let _held = orch.locks().try_acquire(&cfg.workload_id()).unwrap();
    let err = orch.orchestrate(&cfg, CancelToken::never()).await.unwrap_err();

    assert_eq!(err, OrchestrationError::AlreadyInProgress(cfg.workload_id()));
    assert_eq!(sim.writes(), 0);
    assert_eq!(sim.state_reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_attempts_on_one_identity() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");
    let orch = Arc::new(orchestrator(&sim));
    let id = cfg.workload_id();

    let first = {
        let orch = orch.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move { orch.orchestrate(&cfg, CancelToken::never()).await })
    };
    while !orch.locks().is_held(&id) {
        tokio::task::yield_now().await;
    }

    let writes_before = sim.writes();
    let second = orch.orchestrate(&cfg, CancelToken::never()).await;
    assert_eq!(second.unwrap_err(), OrchestrationError::AlreadyInProgress(id.clone()));
    assert_eq!(sim.writes(), writes_before);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.outcome, Outcome::Succeeded);
    assert_eq!(sim.writes(), 1);
    assert!(!orch.locks().is_held(&id));
}

#[tokio::test(start_paused = true)]
async fn separate_orchestrators_share_the_cluster_lease() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");
    let id = cfg.workload_id();
    // Each orchestrator has its own in-process locks, as two CLI runs would.
    let first = orchestrator(&sim);
    let second = orchestrator(&sim);
    assert_ne!(first.holder(), second.holder());

    let running = {
        let cfg = cfg.clone();
        tokio::spawn(async move { first.orchestrate(&cfg, CancelToken::never()).await })
    };
    while sim.lease_holder(&id).is_none() {
        tokio::task::yield_now().await;
    }

    let writes_before = sim.writes();
    let err = second.orchestrate(&cfg, CancelToken::never()).await.unwrap_err();
    assert_eq!(err, OrchestrationError::AlreadyInProgress(id.clone()));
    assert_eq!(sim.writes(), writes_before);

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(sim.writes(), 1);
    assert_eq!(sim.lease_holder(&id), None);

    // Released: the second orchestrator now finds nothing to do.
    assert_eq!(deploy(&second, &cfg).await.outcome, Outcome::NoChangeNeeded);
}

#[tokio::test(start_paused = true)]
async fn lease_held_elsewhere_blocks_without_reads_or_writes() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");
    sim.hold_lease(&cfg.workload_id(), "ci-runner-7", Duration::from_secs(60));

    let err = orchestrator(&sim)
        .orchestrate(&cfg, CancelToken::never())
        .await
        .unwrap_err();

    assert_eq!(err, OrchestrationError::AlreadyInProgress(cfg.workload_id()));
    assert_eq!(sim.writes(), 0);
    assert_eq!(sim.state_reads(), 0);
    assert_eq!(sim.lease_holder(&cfg.workload_id()).as_deref(), Some("ci-runner-7"));
}

#[tokio::test(start_paused = true)]
async fn lapsed_lease_of_a_crashed_run_is_taken_over() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");
    sim.hold_lease(&cfg.workload_id(), "crashed-run", Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(deploy(&orchestrator(&sim), &cfg).await.outcome, Outcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn other_identities_are_not_blocked() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");
    let orch = orchestrator(&sim);

    let _held = orch.locks().try_acquire(&WorkloadId::new("web", "other")).unwrap();
    assert_eq!(deploy(&orch, &cfg).await.outcome, Outcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn missing_metrics_within_window_is_a_warning() {
    let sim = cluster(1);
    sim.push_autoscale(AutoscaleObservation {
        current_replicas: 1,
        min_replicas: 1,
        max_replicas: 1,
        cpu_utilization: None,
        memory_utilization: None,
        metrics_available: false,
    });
    let mut cfg = config(1, "0", "1");
    // Window closes before the grace period runs out.
    cfg.autoscale.window = Duration::from_secs(15);
    cfg.autoscale.metrics_grace = Duration::from_secs(60);

    let report = deploy(&orchestrator(&sim), &cfg).await;

    match &report.outcome {
        Outcome::SucceededWithWarning(Warning::MetricsUnavailable { .. }) => {}
        other => panic!("expected metrics warning, got {other:?}"),
    }
    assert!(report.outcome.is_success());
    assert_eq!(report.attempts.len(), 1);
    let autoscale = report.attempts[0].stages.last().unwrap();
    assert_eq!(autoscale.stage, Stage::Autoscale);
    assert_eq!(autoscale.status, StageStatus::Warning);
}

#[tokio::test(start_paused = true)]
async fn metrics_missing_past_grace_is_still_not_a_failure() {
    let sim = cluster(1);
    sim.fail_autoscale_reads(u32::MAX);
    let cfg = config(1, "0", "1");

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert!(matches!(
        report.outcome,
        Outcome::SucceededWithWarning(Warning::MetricsUnavailable { .. })
    ));
    assert_eq!(report.attempts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn elevated_utilization_is_a_warning() {
    let sim = cluster(3);
    sim.push_autoscale(AutoscaleObservation {
        current_replicas: 3,
        min_replicas: 3,
        max_replicas: 6,
        cpu_utilization: Some(95),
        memory_utilization: Some(40),
        metrics_available: true,
    });
    let mut cfg = config(3, "1", "1");
    cfg.workload.replicas.max = 6;

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert_eq!(
        report.outcome,
        Outcome::SucceededWithWarning(Warning::Elevated {
            utilization: 95,
            projected_replicas: 4,
        })
    );
    assert_eq!(report.trail.last(), Some(&OrchestrationState::SucceededWithWarning));
}

#[tokio::test(start_paused = true)]
async fn unknown_tag_fails_without_writes_or_retries() {
    let sim = Arc::new(SimulatedCluster::new());
    sim.seed_workload(&WorkloadId::new("web", "app"), &old_image(), 1, None);
    let cfg = config(1, "0", "1");

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert!(matches!(
        report.error(),
        Some(OrchestrationError::UnresolvableReference { .. })
    ));
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.failed_stage(), Some(Stage::Resolve));
    assert_eq!(report.last_completed_stage(), None);
    assert_eq!(sim.writes(), 0);
    assert_eq!(sim.state_reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_read_failures_are_absorbed_by_stage_retries() {
    let sim = cluster(1);
    sim.fail_state_reads(2);
    let cfg = config(1, "0", "1");

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.attempts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lagging_reads_do_not_break_the_rollout() {
    let sim = cluster(2);
    sim.set_read_lag(3);
    let cfg = config(2, "1", "1");

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.final_replicas, Some(2));
}

#[tokio::test(start_paused = true)]
async fn cancellation_leaves_partial_rollout_in_place() {
    let sim = cluster(1);
    sim.set_behavior(&new_image(), ReplicaBehavior::NeverReady);
    let cfg = config(1, "0", "1");
    let orch = Arc::new(orchestrator(&sim));
    let handle = CancelHandle::new();

    let run = {
        let orch = orch.clone();
        let cfg = cfg.clone();
        let token = handle.token();
        tokio::spawn(async move { orch.orchestrate(&cfg, token).await })
    };
    while sim.writes() == 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Cancelled);
    assert!(report.attempts[0].is_finalized());
    assert_eq!(report.trail.last(), Some(&OrchestrationState::Cancelled));

    // The surge replica stays; the old one keeps serving.
    let state = sim.snapshot(&cfg.workload_id());
    assert_eq!(state.replicas.len(), 2);
    assert_eq!(state.ready_count(), 1);
    assert!(!orch.locks().is_held(&cfg.workload_id()));
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_records_the_cancelled_attempt() {
    let sim = cluster(1);
    sim.set_behavior(&new_image(), ReplicaBehavior::NeverReady);
    let mut cfg = config(1, "0", "1");
    cfg.retry.initial_backoff = Duration::from_secs(600);
    cfg.retry.max_backoff = Duration::from_secs(600);
    let orch = orchestrator(&sim);
    let handle = CancelHandle::new();

    let run = {
        let cfg = cfg.clone();
        let token = handle.token();
        tokio::spawn(async move { orch.orchestrate(&cfg, token).await })
    };
    // The first attempt stalls after its 30s batch timeout, then waits
    // out a 10m backoff.
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(sim.writes(), 1);
    handle.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(report.attempts[1].number, 2);
    assert_eq!(report.attempts[1].outcome, AttemptOutcome::Cancelled);
    assert!(report.attempts[1].stages.is_empty());
    assert!(report.render().contains("#2 Cancelled before any stage ran"));
    assert_eq!(sim.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_update_is_not_retried() {
    let sim = cluster(1);
    sim.reject_updates(Some("admission webhook denied the request"));
    let cfg = config(1, "0", "1");

    let report = deploy(&orchestrator(&sim), &cfg).await;

    assert!(matches!(report.error(), Some(OrchestrationError::UpdateRejected(_))));
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.failed_stage(), Some(Stage::Rollout));
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_rejected_up_front() {
    let sim = cluster(1);
    let mut cfg = config(1, "0", "1");
    cfg.autoscale.scale_up_threshold = 150;

    let err = orchestrator(&sim)
        .orchestrate(&cfg, CancelToken::never())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestrationError::InvalidConfig(_)));
    assert_eq!(sim.state_reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn plan_reports_without_writing() {
    let sim = cluster(4);
    let cfg = config(4, "1", "1");

    let report = orchestrator(&sim)
        .plan(&cfg, CancelToken::never())
        .await
        .unwrap();

    assert!(report.decision.rollout_required());
    let plan = report.plan.unwrap();
    assert_eq!(plan.target_replicas, 4);
    assert_eq!(plan.total_batches(), 2);
    assert_eq!(report.resolved, new_image());
    assert_eq!(sim.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn plan_on_current_workload_needs_nothing() {
    let sim = cluster(1);
    let cfg = config(1, "0", "1");
    let orch = orchestrator(&sim);
    deploy(&orch, &cfg).await;

    let report = orch.plan(&cfg, CancelToken::never()).await.unwrap();
    assert_eq!(report.decision, Decision::NoChangeNeeded);
    assert!(report.plan.is_none());
}

#[tokio::test(start_paused = true)]
async fn status_reports_replicas_and_autoscaler() {
    let sim = cluster(2);
    let cfg = config(2, "1", "1");

    let status = orchestrator(&sim)
        .status(&cfg, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(status.state.replicas.len(), 2);
    assert_eq!(status.state.ready_count(), 2);
    assert!(status.autoscale.is_some());
}

#[tokio::test(start_paused = true)]
async fn report_serializes_with_stage_labels() {
    let sim = cluster(1);
    sim.set_behavior(&new_image(), ReplicaBehavior::NeverReady);
    let mut cfg = config(1, "0", "1");
    cfg.rollout.batch_timeout = Duration::from_secs(5);
    cfg.retry.max_attempts = 2;

    let report = deploy(&orchestrator(&sim), &cfg).await;
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["outcome"]["outcome"], "failed");
    assert_eq!(json["outcome"]["detail"]["kind"], "retries_exhausted");
    assert_eq!(json["outcome"]["detail"]["detail"]["first_failure"], "rollout");
    assert_eq!(json["attempts"].as_array().unwrap().len(), 2);
    assert!(report.render().contains("failed at:  rollout"));
}
