//! Rollout plan derivation.
//!
//! A plan is an ordered list of replica-replacement steps. Each step may
//! add up to `max_surge` extra replicas and take down up to
//! `max_unavailable` old ones, so at every step
//! `ready >= target - max_unavailable` and
//! `replicas <= target + max_surge`.

use serde::Serialize;

use rollwarden_core::{
    ImageReference, RevisionMarker, WorkloadId, WorkloadSpec, WorkloadState, WorkloadUpdate,
};

/// One batch of replacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RolloutStep {
    /// 1-based batch number.
    pub index: u32,
    /// New replicas created on top of the target count.
    pub surge: u32,
    /// Old replicas taken down before their replacements are ready.
    pub unavailable: u32,
    /// Replicas on the new revision once this step is ready.
    pub updated_after: u32,
}

impl RolloutStep {
    pub fn replaced(&self) -> u32 {
        self.surge + self.unavailable
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutPlan {
    pub workload: WorkloadId,
    pub image: ImageReference,
    pub revision: RevisionMarker,
    pub target_replicas: u32,
    /// Replicas already on the desired revision and ready.
    pub already_updated: u32,
    /// Resolved budgets.
    pub max_unavailable: u32,
    pub max_surge: u32,
    pub steps: Vec<RolloutStep>,
}

impl RolloutPlan {
    /// Derive a plan moving `state` onto `spec`.
    ///
    /// Replicas that already run the desired image, are ready, and sit
    /// under the desired revision count as done, so a retried attempt
    /// resumes instead of recycling them. A plan always has at least one
    /// step: even with nothing to replace, the revision marker has to
    /// land.
    pub fn derive(spec: &WorkloadSpec, state: &WorkloadState) -> Self {
        let revision = RevisionMarker::compute(spec);
        let target = spec.target_replicas(state.declared_replicas);
        let max_unavailable = spec.strategy.max_unavailable.resolve(target);
        let mut max_surge = spec.strategy.max_surge.resolve(target);
        // Both budgets at zero cannot make progress; surge one at a time.
        if max_unavailable == 0 && max_surge == 0 && target > 0 {
            max_surge = 1;
        }

        let already_updated = if state.revision.as_ref() == Some(&revision) {
            state.ready_on(&spec.image).min(target)
        } else {
            0
        };

        let mut steps = Vec::new();
        let mut updated = already_updated;
        while updated < target {
            let left = target - updated;
            let surge = max_surge.min(left);
            let unavailable = max_unavailable.min(left - surge);
            updated += surge + unavailable;
            steps.push(RolloutStep {
                index: steps.len() as u32 + 1,
                surge,
                unavailable,
                updated_after: updated,
            });
        }
        if steps.is_empty() {
            steps.push(RolloutStep {
                index: 1,
                surge: 0,
                unavailable: 0,
                updated_after: target,
            });
        }

        Self {
            workload: spec.id.clone(),
            image: spec.image.clone(),
            revision,
            target_replicas: target,
            already_updated,
            max_unavailable,
            max_surge,
            steps,
        }
    }

    pub fn total_batches(&self) -> u32 {
        self.steps.len() as u32
    }

    /// Worst number of simultaneously unavailable replicas.
    pub fn peak_unavailable(&self) -> u32 {
        self.steps.iter().map(|s| s.unavailable).max().unwrap_or(0)
    }

    /// Worst total replica count.
    pub fn peak_replicas(&self) -> u32 {
        self.target_replicas + self.steps.iter().map(|s| s.surge).max().unwrap_or(0)
    }

    /// The write request for `step`.
    pub fn update_for(&self, spec: &WorkloadSpec, step: &RolloutStep) -> WorkloadUpdate {
        WorkloadUpdate {
            spec: spec.clone(),
            revision: self.revision.clone(),
            target_replicas: self.target_replicas,
            updated_replicas: step.updated_after,
            surge: step.surge,
        }
    }
}
