//! Attempt records: what each stage of one attempt did.

use std::fmt;

use serde::Serialize;

use rollwarden_core::epoch_secs;

use crate::error::OrchestrationError;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolve,
    Detect,
    Rollout,
    Health,
    Autoscale,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Resolve => "resolve",
            Stage::Detect => "detect",
            Stage::Rollout => "rollout",
            Stage::Health => "health",
            Stage::Autoscale => "autoscale",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    /// Completed, with a soft finding.
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OrchestrationError>,
    pub finished_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    NoChangeNeeded,
    Succeeded,
    SucceededWithWarning,
    Failed,
    TimedOut,
    Cancelled,
}

/// One end-to-end execution of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    pub outcome: AttemptOutcome,
    pub stages: Vec<StageResult>,
}

impl AttemptRecord {
    pub fn start(number: u32) -> Self {
        Self {
            number,
            started_at: epoch_secs(),
            finished_at: None,
            outcome: AttemptOutcome::Pending,
            stages: Vec::new(),
        }
    }

    pub fn record(&mut self, stage: Stage, status: StageStatus, detail: impl Into<String>) {
        self.stages.push(StageResult {
            stage,
            status,
            detail: detail.into(),
            error: None,
            finished_at: epoch_secs(),
        });
    }

    pub fn fail(&mut self, stage: Stage, error: &OrchestrationError) {
        self.stages.push(StageResult {
            stage,
            status: StageStatus::Failed,
            detail: error.to_string(),
            error: Some(error.clone()),
            finished_at: epoch_secs(),
        });
    }

    /// Close the record. A finalized record is never reopened.
    pub fn finalize(&mut self, outcome: AttemptOutcome) {
        if self.finished_at.is_some() {
            return;
        }
        self.outcome = outcome;
        self.finished_at = Some(epoch_secs());
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
            .map(|s| s.stage)
    }

    pub fn last_completed_stage(&self) -> Option<Stage> {
        self.stages
            .iter()
            .rev()
            .find(|s| s.status != StageStatus::Failed)
            .map(|s| s.stage)
    }

    pub fn error(&self) -> Option<&OrchestrationError> {
        self.stages.iter().find_map(|s| s.error.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_failed_and_last_completed_stage() {
        let mut record = AttemptRecord::start(1);
        record.record(Stage::Resolve, StageStatus::Succeeded, "pinned");
        record.record(Stage::Detect, StageStatus::Succeeded, "image drift");
        record.fail(Stage::Rollout, &OrchestrationError::Unhealthy("crash".into()));
        record.finalize(AttemptOutcome::Failed);

        assert_eq!(record.failed_stage(), Some(Stage::Rollout));
        assert_eq!(record.last_completed_stage(), Some(Stage::Detect));
        assert!(matches!(record.error(), Some(OrchestrationError::Unhealthy(_))));
    }

    #[test]
    fn finalize_is_one_shot() {
        let mut record = AttemptRecord::start(2);
        record.finalize(AttemptOutcome::Cancelled);
        record.finalize(AttemptOutcome::Succeeded);
        assert_eq!(record.outcome, AttemptOutcome::Cancelled);
        assert!(record.is_finalized());
    }

    #[test]
    fn stage_names_are_lowercase() {
        assert_eq!(Stage::Autoscale.to_string(), "autoscale");
        assert_eq!(serde_json::to_value(Stage::Health).unwrap(), "health");
    }
}
