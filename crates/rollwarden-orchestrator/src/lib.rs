//! rollwarden-orchestrator — one deployment attempt, end to end.
//!
//! Sequences the resolver, change detector, rollout controller, health
//! verifier, and autoscale monitor into attempts, retries failed attempts
//! with exponential backoff, and produces a [`DeploymentReport`].
//!
//! # State machine
//!
//! ```text
//! Idle → Resolving → Detecting ─┬─ NoChangeNeeded ──────────────→ Idle
//!                               └─ RolloutRequired → RollingOut
//!   RollingOut → VerifyingHealth ─┬─ Unhealthy / TimedOut ───────→ Failed
//!                                 └─ Ready → MonitoringScale
//!   MonitoringScale ─┬─ Stable ──────────────────────────────────→ Succeeded
//!                    └─ Elevated / MetricsUnavailable ───────────→ SucceededWithWarning
//! ```
//!
//! `Failed` and a stalled rollout end the attempt; the next attempt
//! starts at `Detecting` after a backoff. At most one attempt per
//! workload identity runs at a time: [`IdentityLocks`] within a process,
//! and an [`AttemptLease`] held in the cluster across processes.

pub mod attempt;
pub mod error;
pub mod lock;
pub mod machine;
pub mod report;

pub use attempt::{AttemptOutcome, AttemptRecord, Stage, StageResult, StageStatus};
pub use error::OrchestrationError;
pub use lock::{AttemptLease, IdentityGuard, IdentityLocks, default_holder};
pub use machine::{OrchestrationState, Orchestrator, PlanReport, StatusReport, retry_backoff};
pub use report::{DeploymentReport, Outcome, Warning};
