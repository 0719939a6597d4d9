//! Interfaces to the external collaborators: the workload control API
//! and the image registry.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::reference::{Digest, ImageReference};
use crate::types::*;

/// Errors from the workload control API.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// Transient failure (network blip, API server hiccup). Worth retrying.
    #[error("control API unavailable: {0}")]
    Unavailable(String),

    /// The response could not be interpreted.
    #[error("malformed workload state: {0}")]
    Malformed(String),
}

impl ControlError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlError::Unavailable(_))
    }
}

/// The cluster side of an orchestration run.
///
/// Reads are eventually consistent snapshots: a state read issued right
/// after an accepted update may not reflect it yet.
#[async_trait]
pub trait WorkloadControl: Send + Sync {
    async fn get_workload_state(&self, id: &WorkloadId) -> Result<WorkloadState, ControlError>;

    async fn apply_workload_update(
        &self,
        id: &WorkloadId,
        update: &WorkloadUpdate,
    ) -> Result<UpdateAck, ControlError>;

    async fn get_autoscale_observation(
        &self,
        id: &WorkloadId,
    ) -> Result<AutoscaleObservation, ControlError>;

    /// Claim the attempt lease for `id` on behalf of `holder`, valid for
    /// `ttl`. Claiming a lease `holder` already owns renews it; an expired
    /// lease is taken over. The lease lives with the cluster, so separate
    /// orchestrator processes see the same holder.
    async fn acquire_lease(
        &self,
        id: &WorkloadId,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseAck, ControlError>;

    /// Give the lease up, if `holder` still owns it.
    async fn release_lease(&self, id: &WorkloadId, holder: &str) -> Result<(), ControlError>;
}

/// Errors from a registry lookup.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("reference not found: {0}")]
    NotFound(String),

    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("registry denied access: {0}")]
    Unauthorized(String),

    #[error("registry returned an unusable response: {0}")]
    Protocol(String),
}

impl RegistryError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Unreachable(_))
    }
}

/// Tag-to-digest lookup.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn resolve_reference(&self, reference: &ImageReference) -> Result<Digest, RegistryError>;
}
