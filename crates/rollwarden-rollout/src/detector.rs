//! Change detection.
//!
//! A rollout is required when any replica runs something other than the
//! desired image, or when the revision marker on the workload differs
//! from the one the desired spec produces. Pure: the caller supplies the
//! state snapshot.

use std::fmt;

use serde::Serialize;

use rollwarden_core::{ImageReference, RevisionMarker, WorkloadSpec, WorkloadState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    NoChangeNeeded,
    RolloutRequired { reason: ChangeReason },
}

impl Decision {
    pub fn rollout_required(&self) -> bool {
        matches!(self, Decision::RolloutRequired { .. })
    }
}

/// Why a rollout is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeReason {
    /// Nothing has ever been applied.
    Initial,
    ImageDrift {
        replica: String,
        running: ImageReference,
        desired: ImageReference,
    },
    ConfigDrift {
        applied: Option<RevisionMarker>,
        desired: RevisionMarker,
    },
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeReason::Initial => f.write_str("workload has never been deployed"),
            ChangeReason::ImageDrift {
                replica,
                running,
                desired,
            } => write!(f, "replica {replica} runs {running}, want {desired}"),
            ChangeReason::ConfigDrift {
                applied: Some(applied),
                desired,
            } => write!(f, "applied revision {applied} differs from {desired}"),
            ChangeReason::ConfigDrift {
                applied: None,
                desired,
            } => write!(f, "no revision recorded, want {desired}"),
        }
    }
}

pub fn detect(spec: &WorkloadSpec, state: &WorkloadState) -> Decision {
    let desired = RevisionMarker::compute(spec);

    if state.replicas.is_empty() && state.declared_replicas == 0 && state.revision.is_none() {
        return Decision::RolloutRequired {
            reason: ChangeReason::Initial,
        };
    }

    if let Some(stale) = state
        .replicas
        .iter()
        .find(|r| !r.image.same_artifact(&spec.image))
    {
        return Decision::RolloutRequired {
            reason: ChangeReason::ImageDrift {
                replica: stale.name.clone(),
                running: stale.image.clone(),
                desired: spec.image.clone(),
            },
        };
    }

    if state.revision.as_ref() != Some(&desired) {
        return Decision::RolloutRequired {
            reason: ChangeReason::ConfigDrift {
                applied: state.revision.clone(),
                desired,
            },
        };
    }

    Decision::NoChangeNeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollwarden_core::*;

    fn digest(fill: char) -> Digest {
        Digest::parse(&format!("sha256:{}", fill.to_string().repeat(64))).unwrap()
    }

    fn spec(fill: char) -> WorkloadSpec {
        WorkloadSpec {
            id: WorkloadId::new("web", "breach-lookup"),
            container: "app".to_string(),
            image: ImageReference::parse("ghcr.io/acme/breach-lookup:1.4.0")
                .unwrap()
                .pinned(digest(fill)),
            resources: ResourceRequirements {
                cpu_request_millis: Some(100),
                memory_request_bytes: Some(128 << 20),
                ..Default::default()
            },
            replicas: ReplicaBounds { min: 1, max: 4 },
            strategy: RolloutStrategy::default(),
        }
    }

    fn running(spec: &WorkloadSpec, replicas: u32) -> WorkloadState {
        WorkloadState {
            declared_replicas: replicas,
            replicas: (0..replicas)
                .map(|i| ReplicaStatus {
                    name: format!("breach-lookup-{i}"),
                    image: spec.image.clone(),
                    ready: true,
                    restart_count: 0,
                })
                .collect(),
            revision: Some(RevisionMarker::compute(spec)),
            last_transition_at: 0,
        }
    }

    #[test]
    fn identical_spec_needs_no_change() {
        let s = spec('a');
        assert_eq!(detect(&s, &running(&s, 2)), Decision::NoChangeNeeded);
    }

    #[test]
    fn absent_workload_is_initial() {
        let decision = detect(&spec('a'), &WorkloadState::default());
        assert_eq!(
            decision,
            Decision::RolloutRequired {
                reason: ChangeReason::Initial
            }
        );
    }

    #[test]
    fn new_digest_is_image_drift() {
        let old = spec('a');
        let new = spec('b');
        match detect(&new, &running(&old, 2)) {
            Decision::RolloutRequired {
                reason: ChangeReason::ImageDrift { replica, running, .. },
            } => {
                assert_eq!(replica, "breach-lookup-0");
                assert_eq!(running, old.image);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn retagged_same_digest_is_not_drift() {
        let s = spec('a');
        let mut state = running(&s, 1);
        state.replicas[0].image = ImageReference::parse("ghcr.io/acme/breach-lookup:latest")
            .unwrap()
            .pinned(digest('a'));
        assert_eq!(detect(&s, &state), Decision::NoChangeNeeded);
    }

    #[test]
    fn resource_change_is_config_drift() {
        let applied = spec('a');
        let mut desired = applied.clone();
        desired.resources.memory_limit_bytes = Some(256 << 20);

        let decision = detect(&desired, &running(&applied, 2));
        assert!(matches!(
            decision,
            Decision::RolloutRequired {
                reason: ChangeReason::ConfigDrift { applied: Some(_), .. }
            }
        ));
    }

    #[test]
    fn bounds_change_is_config_drift() {
        let applied = spec('a');
        let mut desired = applied.clone();
        desired.replicas.max = 8;
        assert!(detect(&desired, &running(&applied, 2)).rollout_required());
    }

    #[test]
    fn missing_marker_is_config_drift() {
        let s = spec('a');
        let mut state = running(&s, 1);
        state.revision = None;
        let decision = detect(&s, &state);
        assert!(matches!(
            decision,
            Decision::RolloutRequired {
                reason: ChangeReason::ConfigDrift { applied: None, .. }
            }
        ));
    }

    #[test]
    fn decision_serializes_tagged() {
        let json = serde_json::to_value(Decision::RolloutRequired {
            reason: ChangeReason::Initial,
        })
        .unwrap();
        assert_eq!(json["decision"], "rollout_required");
        assert_eq!(json["reason"]["kind"], "initial");
    }
}
