//! `KubeControl` against a mock API server.

use std::time::Duration;

use k8s_openapi::chrono::Utc;
use mockito::{Matcher, Server};
use serde_json::{Value, json};

use rollwarden_core::*;
use rollwarden_kube::KubeControl;
use rollwarden_kube::convert::{self, CONTAINER_ANNOTATION, UPDATED_ANNOTATION};

const DIGEST: &str = "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
const DEPLOYMENT: &str = "/apis/apps/v1/namespaces/web/deployments/app";
const AUTOSCALER: &str = "/apis/autoscaling/v2/namespaces/web/horizontalpodautoscalers/app";
const LEASES: &str = "/apis/coordination.k8s.io/v1/namespaces/web/leases";

fn control(server: &Server) -> KubeControl {
    let config = kube::Config::new(server.url().parse().unwrap());
    KubeControl::new(kube::Client::try_from(config).unwrap())
}

fn id() -> WorkloadId {
    WorkloadId::new("web", "app")
}

fn update() -> WorkloadUpdate {
    let spec = WorkloadSpec {
        id: id(),
        container: "server".to_string(),
        image: ImageReference::parse(&format!("ghcr.io/acme/app:v3@{DIGEST}")).unwrap(),
        resources: ResourceRequirements::default(),
        replicas: ReplicaBounds { min: 2, max: 6 },
        strategy: RolloutStrategy {
            max_unavailable: Budget::Count(0),
            max_surge: Budget::Percent(25),
        },
    };
    WorkloadUpdate {
        revision: RevisionMarker::compute(&spec),
        spec,
        target_replicas: 4,
        updated_replicas: 2,
        surge: 1,
    }
}

fn not_found() -> String {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": "not found",
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

fn deployment(revision: &str) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "app",
            "namespace": "web",
            "annotations": { REVISION_ANNOTATION: revision, CONTAINER_ANNOTATION: "server" }
        },
        "spec": {
            "replicas": 3,
            "selector": { "matchLabels": { "app": "app" } },
            "template": {
                "metadata": { "labels": { "app": "app" } },
                "spec": { "containers": [{ "name": "server", "image": "ghcr.io/acme/app:v2" }] }
            }
        }
    })
}

fn pod(name: &str, ready: bool, restarts: i32) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": "web", "labels": { "app": "app" } },
        "status": {
            "containerStatuses": [{
                "name": "server",
                "image": "ghcr.io/acme/app:v2",
                "imageID": format!("docker-pullable://ghcr.io/acme/app@{DIGEST}"),
                "ready": ready,
                "restartCount": restarts
            }]
        }
    })
}

fn autoscaler() -> Value {
    json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "metadata": { "name": "app", "namespace": "web" },
        "spec": {
            "scaleTargetRef": { "apiVersion": "apps/v1", "kind": "Deployment", "name": "app" },
            "minReplicas": 1,
            "maxReplicas": 3
        }
    })
}

#[tokio::test]
async fn update_applies_image_revision_and_surge() {
    let mut server = Server::new_async().await;
    let update = update();

    server
        .mock("GET", DEPLOYMENT)
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(not_found())
        .create_async()
        .await;
    let apply = server
        .mock("PATCH", DEPLOYMENT)
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("fieldManager".into(), "rollwarden".into()),
            Matcher::UrlEncoded("force".into(), "true".into()),
        ]))
        .match_header("content-type", "application/apply-patch+yaml")
        .match_body(Matcher::PartialJson(json!({
            "metadata": {
                "annotations": {
                    REVISION_ANNOTATION: update.revision.as_str(),
                    UPDATED_ANNOTATION: "2"
                }
            },
            "spec": {
                "replicas": 4,
                "selector": { "matchLabels": { "app.kubernetes.io/name": "app" } },
                "strategy": { "rollingUpdate": { "maxSurge": "25%", "maxUnavailable": 0 } },
                "template": {
                    "spec": {
                        "containers": [{
                            "name": "server",
                            "image": format!("ghcr.io/acme/app:v3@{DIGEST}")
                        }]
                    }
                }
            }
        })))
        .with_status(200)
        .with_body(deployment(update.revision.as_str()).to_string())
        .create_async()
        .await;
    let hpa_patch = server
        .mock("PATCH", AUTOSCALER)
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    server
        .mock("GET", AUTOSCALER)
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(not_found())
        .create_async()
        .await;

    let ack = control(&server)
        .apply_workload_update(&id(), &update)
        .await
        .unwrap();

    assert_eq!(ack, UpdateAck::Accepted);
    apply.assert_async().await;
    hpa_patch.assert_async().await;
}

#[tokio::test]
async fn update_carries_bounds_onto_the_autoscaler() {
    let mut server = Server::new_async().await;
    let update = update();

    server
        .mock("GET", DEPLOYMENT)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(deployment("old").to_string())
        .create_async()
        .await;
    // Existing selector is reused, not re-sent.
    let apply = server
        .mock("PATCH", DEPLOYMENT)
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(json!({
            "spec": { "template": { "metadata": { "labels": { "app": "app" } } } }
        })))
        .with_status(200)
        .with_body(deployment(update.revision.as_str()).to_string())
        .create_async()
        .await;
    server
        .mock("GET", AUTOSCALER)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(autoscaler().to_string())
        .create_async()
        .await;
    let bounds = server
        .mock("PATCH", AUTOSCALER)
        .match_query(Matcher::Any)
        .match_header("content-type", "application/merge-patch+json")
        .match_body(Matcher::Json(json!({
            "spec": { "minReplicas": 2, "maxReplicas": 6 }
        })))
        .with_status(200)
        .with_body(autoscaler().to_string())
        .create_async()
        .await;

    let ack = control(&server)
        .apply_workload_update(&id(), &update)
        .await
        .unwrap();

    assert_eq!(ack, UpdateAck::Accepted);
    apply.assert_async().await;
    bounds.assert_async().await;
}

#[tokio::test]
async fn invalid_update_is_rejected_not_retried() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", DEPLOYMENT)
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(not_found())
        .create_async()
        .await;
    server
        .mock("PATCH", DEPLOYMENT)
        .match_query(Matcher::Any)
        .with_status(422)
        .with_body(
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "spec.replicas: Invalid value",
                "reason": "Invalid",
                "code": 422
            })
            .to_string(),
        )
        .create_async()
        .await;

    let ack = control(&server)
        .apply_workload_update(&id(), &update())
        .await
        .unwrap();

    match ack {
        UpdateAck::Rejected(reason) => assert!(reason.contains("spec.replicas"), "{reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn state_decodes_revision_and_replicas() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", DEPLOYMENT)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(deployment("f00dfeed").to_string())
        .create_async()
        .await;
    let pods = server
        .mock("GET", "/api/v1/namespaces/web/pods")
        .match_query(Matcher::UrlEncoded("labelSelector".into(), "app=app".into()))
        .with_status(200)
        .with_body(
            json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {},
                "items": [pod("app-a", true, 0), pod("app-b", false, 5)]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let state = control(&server).get_workload_state(&id()).await.unwrap();

    assert_eq!(state.declared_replicas, 3);
    assert_eq!(state.revision, Some(RevisionMarker::from_annotation("f00dfeed")));
    assert_eq!(state.replicas.len(), 2);
    assert_eq!(state.ready_count(), 1);
    assert_eq!(state.replicas[1].name, "app-b");
    assert_eq!(state.replicas[1].restart_count, 5);
    assert_eq!(
        state.replicas[0].image.digest(),
        Some(&Digest::parse(DIGEST).unwrap())
    );
    pods.assert_async().await;
}

#[tokio::test]
async fn missing_deployment_reads_as_empty() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", DEPLOYMENT)
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(not_found())
        .create_async()
        .await;

    let state = control(&server).get_workload_state(&id()).await.unwrap();
    assert_eq!(state, WorkloadState::default());
}

#[tokio::test]
async fn server_errors_are_transient() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", DEPLOYMENT)
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body(
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "etcd leader changed",
                "reason": "ServiceUnavailable",
                "code": 503
            })
            .to_string(),
        )
        .create_async()
        .await;

    let err = control(&server).get_workload_state(&id()).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
}

#[tokio::test]
async fn lease_is_created_when_absent() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", &*format!("{LEASES}/app-rollwarden"))
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(not_found())
        .create_async()
        .await;
    let lease = convert::lease_object(&id(), "ci-1", Duration::from_secs(60), Utc::now(), None);
    let create = server
        .mock("POST", LEASES)
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(json!({
            "metadata": { "name": "app-rollwarden" },
            "spec": { "holderIdentity": "ci-1", "leaseDurationSeconds": 60 }
        })))
        .with_status(201)
        .with_body(serde_json::to_string(&lease).unwrap())
        .create_async()
        .await;

    let ack = control(&server)
        .acquire_lease(&id(), "ci-1", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(ack, LeaseAck::Acquired);
    create.assert_async().await;
}

#[tokio::test]
async fn live_lease_of_another_holder_is_not_overwritten() {
    let mut server = Server::new_async().await;
    let mut held = convert::lease_object(&id(), "ci-2", Duration::from_secs(60), Utc::now(), None);
    held.metadata.resource_version = Some("7".to_string());
    server
        .mock("GET", &*format!("{LEASES}/app-rollwarden"))
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(serde_json::to_string(&held).unwrap())
        .create_async()
        .await;
    let replace = server
        .mock("PUT", &*format!("{LEASES}/app-rollwarden"))
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let delete = server
        .mock("DELETE", &*format!("{LEASES}/app-rollwarden"))
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let control = control(&server);
    let ack = control
        .acquire_lease(&id(), "ci-1", Duration::from_secs(60))
        .await
        .unwrap();
    control.release_lease(&id(), "ci-1").await.unwrap();

    assert_eq!(ack, LeaseAck::Held { holder: "ci-2".to_string() });
    replace.assert_async().await;
    delete.assert_async().await;
}
