//! The final report handed back to the caller.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use rollwarden_core::config::duration_str;
use rollwarden_core::{ImageReference, WorkloadId};

use crate::attempt::{AttemptRecord, Stage};
use crate::error::OrchestrationError;
use crate::machine::OrchestrationState;

/// Soft findings that do not fail a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    MetricsUnavailable {
        #[serde(with = "duration_str")]
        waited: Duration,
    },
    Elevated {
        utilization: u32,
        projected_replicas: u32,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::MetricsUnavailable { waited } => {
                write!(f, "{}", OrchestrationError::MetricsUnavailable(*waited))
            }
            Warning::Elevated {
                utilization,
                projected_replicas,
            } => write!(
                f,
                "utilization {utilization}% above scale-up threshold, autoscaler expected to move to {projected_replicas} replicas"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    NoChangeNeeded,
    Succeeded,
    SucceededWithWarning(Warning),
    Failed(OrchestrationError),
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::NoChangeNeeded | Outcome::Succeeded | Outcome::SucceededWithWarning(_)
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NoChangeNeeded => f.write_str("no change needed"),
            Outcome::Succeeded => f.write_str("succeeded"),
            Outcome::SucceededWithWarning(w) => write!(f, "succeeded with warning: {w}"),
            Outcome::Failed(e) => write!(f, "failed: {e}"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentReport {
    pub workload: WorkloadId,
    /// Reference as requested.
    pub requested: String,
    /// Digest-pinned reference, once resolved.
    pub resolved: Option<ImageReference>,
    pub outcome: Outcome,
    pub final_replicas: Option<u32>,
    pub attempts: Vec<AttemptRecord>,
    /// State machine states visited, in order.
    pub trail: Vec<OrchestrationState>,
}

impl DeploymentReport {
    /// Stage that failed in the last attempt.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.attempts.last().and_then(AttemptRecord::failed_stage)
    }

    /// Last stage that completed in the last attempt.
    pub fn last_completed_stage(&self) -> Option<Stage> {
        self.attempts.last().and_then(AttemptRecord::last_completed_stage)
    }

    pub fn error(&self) -> Option<&OrchestrationError> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Human-readable summary, one fact per line.
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("workload:   {}", self.workload),
            format!("requested:  {}", self.requested),
        ];
        if let Some(resolved) = &self.resolved {
            lines.push(format!("resolved:   {resolved}"));
        }
        lines.push(format!("outcome:    {}", self.outcome));
        if let Some(replicas) = self.final_replicas {
            lines.push(format!("replicas:   {replicas}"));
        }
        lines.push(format!("attempts:   {}", self.attempts.len()));
        if matches!(self.outcome, Outcome::Failed(_)) {
            lines.push(format!(
                "failed at:  {}",
                self.failed_stage().map_or("-".to_string(), |s| s.to_string())
            ));
            lines.push(format!(
                "last good:  {}",
                self.last_completed_stage()
                    .map_or("-".to_string(), |s| s.to_string())
            ));
        }
        for attempt in &self.attempts {
            if attempt.stages.is_empty() {
                lines.push(format!(
                    "  #{} {:?} before any stage ran",
                    attempt.number, attempt.outcome
                ));
            }
            for stage in &attempt.stages {
                lines.push(format!(
                    "  #{} {:<9} {:?}: {}",
                    attempt.number, stage.stage, stage.status, stage.detail
                ));
            }
        }
        lines.join("\n")
    }
}
