//! Snapshot assessment.

use rollwarden_core::{ImageReference, RevisionMarker, WorkloadState};

/// What the verifier is waiting for.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthTarget {
    /// Image the updated replicas must run.
    pub image: ImageReference,
    /// Revision the workload must report; `None` skips the check.
    pub revision: Option<RevisionMarker>,
    /// Ready replicas on `image` required.
    pub ready_replicas: u32,
    /// A not-ready replica restarted more often than this is crash-looping.
    pub restart_threshold: u32,
}

/// Verdict on one workload snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    Ready,
    NotReadyYet { ready: u32, expected: u32 },
    CrashLoop { replica: String, restarts: u32 },
}

/// Assess one snapshot against `target`.
///
/// A snapshot still carrying an older revision has not caught up with
/// the last write yet and is never `Ready`.
pub fn assess(state: &WorkloadState, target: &HealthTarget) -> Assessment {
    if let Some(crashing) = state
        .running(&target.image)
        .filter(|r| !r.ready && r.restart_count > target.restart_threshold)
        .max_by_key(|r| r.restart_count)
    {
        return Assessment::CrashLoop {
            replica: crashing.name.clone(),
            restarts: crashing.restart_count,
        };
    }

    let ready = state.ready_on(&target.image);
    let caught_up = target
        .revision
        .as_ref()
        .is_none_or(|rev| state.revision.as_ref() == Some(rev));
    if caught_up && ready >= target.ready_replicas {
        Assessment::Ready
    } else {
        Assessment::NotReadyYet {
            ready,
            expected: target.ready_replicas,
        }
    }
}
