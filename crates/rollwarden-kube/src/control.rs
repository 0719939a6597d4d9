//! `WorkloadControl` against the Kubernetes API server.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::chrono::Utc;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Api, Client};
use tracing::{debug, warn};

use rollwarden_core::{
    AutoscaleObservation, ControlError, LeaseAck, UpdateAck, WorkloadControl, WorkloadId,
    WorkloadState, WorkloadUpdate,
};

use crate::convert::{self, LeaseClaim};

/// Field manager recorded on every server-side apply.
pub const FIELD_MANAGER: &str = "rollwarden";

pub struct KubeControl {
    client: Client,
}

impl KubeControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, ControlError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ControlError::Unavailable(format!("kubernetes client: {e}")))?;
        Ok(Self::new(client))
    }

    fn autoscalers(&self, id: &WorkloadId) -> Api<HorizontalPodAutoscaler> {
        Api::namespaced(self.client.clone(), &id.namespace)
    }

    /// Carry replica bounds onto the autoscaler, when there is one. The
    /// deployment write already landed, so a failure here only warns.
    async fn sync_autoscaler_bounds(&self, id: &WorkloadId, update: &WorkloadUpdate) {
        let api = self.autoscalers(id);
        match api.get_opt(&id.name).await {
            Ok(Some(_)) => {
                let patch = convert::autoscaler_bounds_patch(update);
                if let Err(e) = api
                    .patch(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    warn!(workload = %id, error = %e, "failed to update autoscaler bounds");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(workload = %id, error = %e, "failed to read autoscaler"),
        }
    }

    fn deployments(&self, id: &WorkloadId) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &id.namespace)
    }

    async fn deployment(&self, id: &WorkloadId) -> Result<Option<Deployment>, ControlError> {
        self.deployments(id)
            .get_opt(&id.name)
            .await
            .map_err(control_error)
    }

    fn leases(&self, id: &WorkloadId) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &id.namespace)
    }

    async fn pods(&self, id: &WorkloadId, deployment: &Deployment) -> Result<Vec<Pod>, ControlError> {
        let Some(labels) = convert::match_labels(deployment) else {
            return Err(ControlError::Malformed(format!("deployment {id} has no selector labels")));
        };
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &id.namespace);
        let params = ListParams::default().labels(&convert::selector_string(labels));
        let list = api.list(&params).await.map_err(control_error)?;
        Ok(list.items)
    }
}

#[async_trait]
impl WorkloadControl for KubeControl {
    async fn get_workload_state(&self, id: &WorkloadId) -> Result<WorkloadState, ControlError> {
        let Some(deployment) = self.deployment(id).await? else {
            debug!(workload = %id, "deployment does not exist yet");
            return Ok(WorkloadState::default());
        };
        let pods = self.pods(id, &deployment).await?;
        Ok(convert::workload_state(&deployment, &pods))
    }

    async fn apply_workload_update(
        &self,
        id: &WorkloadId,
        update: &WorkloadUpdate,
    ) -> Result<UpdateAck, ControlError> {
        let existing = self.deployment(id).await?;
        let selector = existing.as_ref().and_then(convert::match_labels);
        let manifest = convert::deployment_manifest(update, selector);

        let params = PatchParams::apply(FIELD_MANAGER).force();
        match self
            .deployments(id)
            .patch(&id.name, &params, &Patch::Apply(&manifest))
            .await
        {
            Ok(_) => {
                debug!(
                    workload = %id,
                    revision = %update.revision,
                    updated = update.updated_replicas,
                    target = update.target_replicas,
                    "deployment patched"
                );
                self.sync_autoscaler_bounds(id, update).await;
                Ok(UpdateAck::Accepted)
            }
            Err(kube::Error::Api(ae)) if matches!(ae.code, 400 | 403 | 409 | 422) => {
                warn!(workload = %id, code = ae.code, reason = %ae.reason, "update rejected");
                Ok(UpdateAck::Rejected(format!("{}: {}", ae.reason, ae.message)))
            }
            Err(e) => Err(control_error(e)),
        }
    }

    async fn get_autoscale_observation(
        &self,
        id: &WorkloadId,
    ) -> Result<AutoscaleObservation, ControlError> {
        if let Some(hpa) = self
            .autoscalers(id)
            .get_opt(&id.name)
            .await
            .map_err(control_error)?
        {
            return Ok(convert::autoscale_observation(&hpa));
        }

        debug!(workload = %id, "no autoscaler, reporting fixed size");
        let state = self.get_workload_state(id).await?;
        Ok(convert::fixed_observation(
            state.declared_replicas,
            state.replicas.len() as u32,
        ))
    }

    async fn acquire_lease(
        &self,
        id: &WorkloadId,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseAck, ControlError> {
        let api = self.leases(id);
        let name = convert::lease_name(id);
        let now = Utc::now();
        let existing = api.get_opt(&name).await.map_err(control_error)?;

        let written = match &existing {
            None => {
                let lease = convert::lease_object(id, holder, ttl, now, None);
                api.create(&PostParams::default(), &lease).await
            }
            Some(current) => {
                if let LeaseClaim::Held(other) = convert::lease_claim(current, holder, now) {
                    return Ok(LeaseAck::Held { holder: other });
                }
                let lease = convert::lease_object(id, holder, ttl, now, Some(current));
                api.replace(&name, &PostParams::default(), &lease).await
            }
        };
        match written {
            Ok(_) => {
                debug!(workload = %id, holder, lease = %name, "lease held");
                Ok(LeaseAck::Acquired)
            }
            // Another claimant wrote between our read and write.
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(LeaseAck::Held {
                holder: "a concurrent claimant".to_string(),
            }),
            Err(e) => Err(control_error(e)),
        }
    }

    async fn release_lease(&self, id: &WorkloadId, holder: &str) -> Result<(), ControlError> {
        let api = self.leases(id);
        let name = convert::lease_name(id);
        let Some(lease) = api.get_opt(&name).await.map_err(control_error)? else {
            return Ok(());
        };
        if convert::lease_claim(&lease, holder, Utc::now()) != LeaseClaim::Ours {
            return Ok(());
        }

        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: lease.metadata.resource_version.clone(),
                uid: lease.metadata.uid.clone(),
            }),
            ..DeleteParams::default()
        };
        match api.delete(&name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if matches!(ae.code, 404 | 409) => Ok(()),
            Err(e) => Err(control_error(e)),
        }
    }
}

/// Throttling and server errors are worth another poll; any other API
/// answer will not change on retry.
fn control_error(e: kube::Error) -> ControlError {
    match e {
        kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
            ControlError::Unavailable(format!("{} {}: {}", ae.code, ae.reason, ae.message))
        }
        kube::Error::Api(ae) => {
            ControlError::Malformed(format!("{} {}: {}", ae.code, ae.reason, ae.message))
        }
        kube::Error::SerdeError(e) => ControlError::Malformed(e.to_string()),
        other => ControlError::Unavailable(other.to_string()),
    }
}
