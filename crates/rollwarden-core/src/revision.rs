//! Revision markers: a short fingerprint of the last applied spec.
//!
//! The marker travels with the workload itself (an annotation on
//! Kubernetes), so every orchestrator instance observes the same value.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::types::WorkloadSpec;

/// Annotation key the marker is stored under.
pub const REVISION_ANNOTATION: &str = "rollwarden.dev/revision";

/// Opaque fingerprint of an applied spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionMarker(String);

impl RevisionMarker {
    /// Fingerprint everything a rollout would change: image, resources,
    /// replica bounds, and strategy.
    pub fn compute(spec: &WorkloadSpec) -> Self {
        let canonical = serde_json::json!({
            "container": spec.container,
            "image": spec.image.to_string(),
            "resources": spec.resources,
            "replicas": spec.replicas,
            "strategy": spec.strategy,
        });
        let hash = Sha256::digest(canonical.to_string().as_bytes());
        Self(hex::encode(&hash[..8]))
    }

    /// Wrap a marker read back from the cluster.
    pub fn from_annotation(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ImageReference;
    use crate::types::*;

    fn spec() -> WorkloadSpec {
        WorkloadSpec {
            id: WorkloadId::new("web", "breach-lookup"),
            container: "app".to_string(),
            image: ImageReference::parse("ghcr.io/acme/breach-lookup:1.0.0").unwrap(),
            resources: ResourceRequirements {
                cpu_request_millis: Some(100),
                cpu_limit_millis: Some(500),
                memory_request_bytes: Some(128 << 20),
                memory_limit_bytes: Some(256 << 20),
            },
            replicas: ReplicaBounds { min: 2, max: 10 },
            strategy: RolloutStrategy::default(),
        }
    }

    #[test]
    fn marker_is_stable_and_short() {
        let a = RevisionMarker::compute(&spec());
        let b = RevisionMarker::compute(&spec());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn marker_changes_with_resources() {
        let base = RevisionMarker::compute(&spec());
        let mut changed = spec();
        changed.resources.memory_limit_bytes = Some(512 << 20);
        assert_ne!(base, RevisionMarker::compute(&changed));
    }

    #[test]
    fn marker_changes_with_bounds() {
        let base = RevisionMarker::compute(&spec());
        let mut changed = spec();
        changed.replicas.max = 12;
        assert_ne!(base, RevisionMarker::compute(&changed));
    }

    #[test]
    fn marker_ignores_identity() {
        let base = RevisionMarker::compute(&spec());
        let mut moved = spec();
        moved.id = WorkloadId::new("staging", "breach-lookup");
        assert_eq!(base, RevisionMarker::compute(&moved));
    }
}
