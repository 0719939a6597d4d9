//! Kubernetes objects ↔ rollwarden data model.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{DateTime, Utc};
use serde_json::{Value, json};

use rollwarden_core::{
    AutoscaleObservation, Budget, ImageReference, REVISION_ANNOTATION, ReplicaStatus,
    RevisionMarker, WorkloadId, WorkloadState, WorkloadUpdate,
};

/// Annotation naming the container that carries the workload image.
pub const CONTAINER_ANNOTATION: &str = "rollwarden.dev/container";
/// Annotation recording how many replicas the last step moved over.
pub const UPDATED_ANNOTATION: &str = "rollwarden.dev/updated-replicas";

const NAME_LABEL: &str = "app.kubernetes.io/name";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Build the server-side apply body for `update`.
///
/// `selector` is the live deployment's `matchLabels`, if it exists; the
/// selector is immutable, so an existing one is reused for the pod
/// template and left out of the patch.
pub fn deployment_manifest(
    update: &WorkloadUpdate,
    selector: Option<&BTreeMap<String, String>>,
) -> Value {
    let spec = &update.spec;
    let id = &spec.id;
    let pod_labels: BTreeMap<String, String> = match selector {
        Some(labels) => labels.clone(),
        None => BTreeMap::from([(NAME_LABEL.to_string(), id.name.clone())]),
    };

    let mut container = json!({
        "name": spec.container,
        "image": spec.image.to_string(),
    });
    let resources = resources(update);
    if !resources.as_object().is_some_and(|r| r.is_empty()) {
        container["resources"] = resources;
    }

    let mut manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": id.name,
            "namespace": id.namespace,
            "labels": { MANAGED_BY_LABEL: "rollwarden" },
            "annotations": {
                REVISION_ANNOTATION: update.revision.as_str(),
                CONTAINER_ANNOTATION: spec.container,
                UPDATED_ANNOTATION: update.updated_replicas.to_string(),
            },
        },
        "spec": {
            "replicas": update.target_replicas,
            "strategy": {
                "type": "RollingUpdate",
                "rollingUpdate": {
                    "maxUnavailable": budget(spec.strategy.max_unavailable),
                    "maxSurge": budget(spec.strategy.max_surge),
                },
            },
            "template": {
                "metadata": {
                    "labels": pod_labels,
                    "annotations": { REVISION_ANNOTATION: update.revision.as_str() },
                },
                "spec": { "containers": [container] },
            },
        },
    });
    if selector.is_none() {
        manifest["spec"]["selector"] = json!({ "matchLabels": pod_labels });
    }
    manifest
}

fn budget(b: Budget) -> Value {
    match b {
        Budget::Count(n) => json!(n),
        Budget::Percent(_) => json!(b.to_string()),
    }
}

fn resources(update: &WorkloadUpdate) -> Value {
    let r = &update.spec.resources;
    let mut requests = serde_json::Map::new();
    let mut limits = serde_json::Map::new();
    if let Some(cpu) = r.cpu_request_millis {
        requests.insert("cpu".into(), json!(format!("{cpu}m")));
    }
    if let Some(mem) = r.memory_request_bytes {
        requests.insert("memory".into(), json!(mem.to_string()));
    }
    if let Some(cpu) = r.cpu_limit_millis {
        limits.insert("cpu".into(), json!(format!("{cpu}m")));
    }
    if let Some(mem) = r.memory_limit_bytes {
        limits.insert("memory".into(), json!(mem.to_string()));
    }
    let mut out = serde_json::Map::new();
    if !requests.is_empty() {
        out.insert("requests".into(), Value::Object(requests));
    }
    if !limits.is_empty() {
        out.insert("limits".into(), Value::Object(limits));
    }
    Value::Object(out)
}

/// Merge patch carrying the replica bounds onto an existing autoscaler.
pub fn autoscaler_bounds_patch(update: &WorkloadUpdate) -> Value {
    let bounds = update.spec.replicas;
    json!({
        "spec": {
            "minReplicas": bounds.min.max(1),
            "maxReplicas": bounds.max,
        }
    })
}

/// The deployment's `matchLabels`, rendered as a label selector string.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn match_labels(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .filter(|labels| !labels.is_empty())
}

/// Container the workload image lives in: the annotated one, else the
/// first container of the pod template.
pub fn workload_container(deployment: &Deployment) -> Option<String> {
    if let Some(name) = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONTAINER_ANNOTATION))
    {
        return Some(name.clone());
    }
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .map(|c| c.name.clone())
}

/// Map a deployment and its pods onto [`WorkloadState`]. Pods being
/// deleted are skipped.
pub fn workload_state(deployment: &Deployment, pods: &[Pod]) -> WorkloadState {
    let container = workload_container(deployment);
    let replicas = pods
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter_map(|p| replica_status(p, container.as_deref()))
        .collect();

    let revision = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_ANNOTATION))
        .map(|v| RevisionMarker::from_annotation(v.as_str()));

    let last_transition_at = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| {
            conds
                .iter()
                .filter_map(|c| c.last_update_time.as_ref().or(c.last_transition_time.as_ref()))
                .map(|t| t.0.timestamp().max(0) as u64)
                .max()
        })
        .unwrap_or(0);

    WorkloadState {
        declared_replicas: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .map_or(1, |r| r.max(0) as u32),
        replicas,
        revision,
        last_transition_at,
    }
}

fn replica_status(pod: &Pod, container: Option<&str>) -> Option<ReplicaStatus> {
    let name = pod.metadata.name.clone()?;
    let status = pod.status.as_ref();
    let statuses = status.and_then(|s| s.container_statuses.as_deref()).unwrap_or(&[]);
    let container_status = match container {
        Some(c) => statuses.iter().find(|s| s.name == c),
        None => statuses.first(),
    };

    let declared_image = pod.spec.as_ref().and_then(|spec| {
        let c = match container {
            Some(c) => spec.containers.iter().find(|x| x.name == c),
            None => spec.containers.first(),
        };
        c.and_then(|c| c.image.clone())
    });

    let image = match container_status {
        Some(cs) => running_image(&cs.image, &cs.image_id)
            .or_else(|| declared_image.as_deref().and_then(|i| ImageReference::parse(i).ok())),
        None => declared_image.as_deref().and_then(|i| ImageReference::parse(i).ok()),
    }?;

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"));

    Some(ReplicaStatus {
        name,
        image,
        ready,
        restart_count: container_status.map_or(0, |cs| cs.restart_count.max(0) as u32),
    })
}

/// The reference a container actually runs. The runtime reports the
/// pulled digest in `imageID` (`docker-pullable://repo@sha256:…`,
/// `repo@sha256:…`, or a bare `sha256:…`); it pins whatever `image` says.
pub fn running_image(image: &str, image_id: &str) -> Option<ImageReference> {
    let base = ImageReference::parse(image).ok()?;
    let id = image_id.rsplit_once("://").map_or(image_id, |(_, rest)| rest);
    let digest = match id.rsplit_once('@') {
        Some((_, d)) => d,
        None => id,
    };
    match rollwarden_core::Digest::parse(digest) {
        Ok(d) => Some(base.pinned(d)),
        Err(_) => Some(base),
    }
}

/// Map an autoscaler onto [`AutoscaleObservation`].
pub fn autoscale_observation(hpa: &HorizontalPodAutoscaler) -> AutoscaleObservation {
    let spec = hpa.spec.as_ref();
    let status = hpa.status.as_ref();
    let utilization = |resource: &str| {
        status
            .and_then(|s| s.current_metrics.as_ref())
            .and_then(|metrics| {
                metrics.iter().find_map(|m| {
                    m.resource
                        .as_ref()
                        .filter(|r| r.name == resource)
                        .and_then(|r| r.current.average_utilization)
                })
            })
            .map(|u| u.max(0) as u32)
    };
    let cpu_utilization = utilization("cpu");
    let memory_utilization = utilization("memory");

    // `ScalingActive=False` means the controller could not fetch metrics.
    let scaling_inactive = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "ScalingActive" && c.status == "False")
        });

    AutoscaleObservation {
        current_replicas: status
            .and_then(|s| s.current_replicas)
            .map_or(0, |r| r.max(0) as u32),
        min_replicas: spec.and_then(|s| s.min_replicas).map_or(1, |r| r.max(0) as u32),
        max_replicas: spec.map_or(0, |s| s.max_replicas.max(0) as u32),
        metrics_available: !scaling_inactive
            && (cpu_utilization.is_some() || memory_utilization.is_some()),
        cpu_utilization,
        memory_utilization,
    }
}

/// Name of the `coordination.k8s.io/v1` Lease guarding attempts on `id`.
pub fn lease_name(id: &WorkloadId) -> String {
    format!("{}-rollwarden", id.name)
}

/// Who may claim a lease right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseClaim {
    /// No holder, or the holder stopped renewing.
    Free,
    /// Already held by the claimant.
    Ours,
    Held(String),
}

/// Classify `lease` for `holder` at `now`. A lease counts as live until
/// `leaseDurationSeconds` past its last renewal.
pub fn lease_claim(lease: &Lease, holder: &str, now: DateTime<Utc>) -> LeaseClaim {
    let Some(spec) = lease.spec.as_ref() else {
        return LeaseClaim::Free;
    };
    let current = match spec.holder_identity.as_deref() {
        Some(h) if !h.is_empty() => h,
        _ => return LeaseClaim::Free,
    };
    if current == holder {
        return LeaseClaim::Ours;
    }
    let renewed = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0.timestamp());
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(0));
    match renewed {
        Some(at) if at + duration >= now.timestamp() => LeaseClaim::Held(current.to_string()),
        _ => LeaseClaim::Free,
    }
}

/// Lease body claiming `id` for `holder`. An `existing` lease keeps its
/// metadata, so the replace carries its `resourceVersion` and loses to
/// any concurrent writer.
pub fn lease_object(
    id: &WorkloadId,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
    existing: Option<&Lease>,
) -> Lease {
    let previous = existing.and_then(|l| l.spec.as_ref());
    let renewing = previous.and_then(|s| s.holder_identity.as_deref()) == Some(holder);
    let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
    let metadata = match existing {
        Some(lease) => lease.metadata.clone(),
        None => ObjectMeta {
            name: Some(lease_name(id)),
            namespace: Some(id.namespace.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                "rollwarden".to_string(),
            )])),
            ..ObjectMeta::default()
        },
    };
    let acquire_time = if renewing {
        previous.and_then(|s| s.acquire_time.clone())
    } else {
        None
    };

    Lease {
        metadata,
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(i32::try_from(ttl.as_secs()).unwrap_or(i32::MAX)),
            acquire_time: acquire_time.or(Some(MicroTime(now))),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if renewing || existing.is_none() {
                transitions
            } else {
                transitions + 1
            }),
            ..LeaseSpec::default()
        }),
    }
}

/// Observation for a workload without an autoscaler: pinned at its
/// declared size, no metrics.
pub fn fixed_observation(declared_replicas: u32, running: u32) -> AutoscaleObservation {
    AutoscaleObservation {
        current_replicas: running,
        min_replicas: declared_replicas,
        max_replicas: declared_replicas,
        cpu_utilization: None,
        memory_utilization: None,
        metrics_available: false,
    }
}
