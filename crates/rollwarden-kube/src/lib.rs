//! rollwarden-kube — [`WorkloadControl`](rollwarden_core::WorkloadControl)
//! over a Kubernetes cluster.
//!
//! A workload is a `Deployment`; its replicas are the pods matching the
//! deployment's selector; its autoscaler is the `HorizontalPodAutoscaler`
//! of the same name. Updates go out as server-side apply patches that
//! carry the revision marker as an annotation. Attempts are guarded by a
//! `coordination.k8s.io/v1` Lease named `<workload>-rollwarden`.
//!
//! # Components
//!
//! - **`convert`** — pure mapping between Kubernetes objects and the
//!   rollwarden data model
//! - **`control`** — the API client

pub mod control;
pub mod convert;

pub use control::{FIELD_MANAGER, KubeControl};
