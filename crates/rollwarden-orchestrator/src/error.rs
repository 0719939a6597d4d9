//! Orchestration error taxonomy.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use rollwarden_core::WorkloadId;
use rollwarden_core::config::duration_str;
use rollwarden_rollout::StallCause;

use crate::attempt::Stage;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OrchestrationError {
    #[error("cannot resolve {reference}: {reason}")]
    UnresolvableReference { reference: String, reason: String },

    #[error("an orchestration attempt for {0} is already in progress")]
    AlreadyInProgress(WorkloadId),

    #[error(
        "rollout stalled at batch {failed_batch} (last good batch: {}): {cause}",
        batch_label(.last_good_batch)
    )]
    RolloutStalled {
        last_good_batch: Option<u32>,
        failed_batch: u32,
        cause: StallCause,
    },

    #[error("workload unhealthy: {0}")]
    Unhealthy(String),

    #[error("replicas not ready within {}", duration_str_display(.0))]
    TimedOut(#[serde(with = "duration_str")] Duration),

    /// Soft: surfaced as a warning, never as a failure.
    #[error("autoscaler metrics unavailable after {}", duration_str_display(.0))]
    MetricsUnavailable(#[serde(with = "duration_str")] Duration),

    #[error("orchestration cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts (first failure in {first_failure} stage): {last_error}")]
    RetriesExhausted {
        attempts: u32,
        first_failure: Stage,
        last_error: Box<OrchestrationError>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("update rejected by the control API: {0}")]
    UpdateRejected(String),

    /// Stage-level retries against the control API ran out.
    #[error("control API unavailable: {0}")]
    Cluster(String),
}

impl OrchestrationError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestrationError::RolloutStalled { .. }
                | OrchestrationError::Unhealthy(_)
                | OrchestrationError::TimedOut(_)
                | OrchestrationError::Cluster(_)
        )
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, OrchestrationError::MetricsUnavailable(_))
    }
}

fn batch_label(batch: &Option<u32>) -> String {
    batch.map_or_else(|| "none".to_string(), |b| b.to_string())
}

fn duration_str_display(d: &Duration) -> String {
    rollwarden_core::config::format_duration(*d)
}
