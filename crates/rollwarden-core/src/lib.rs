//! rollwarden-core — shared vocabulary for the deployment orchestrator.
//!
//! Holds the data model (workload spec, observed state, autoscaler
//! snapshots), image references and revision markers, the interfaces to
//! the two external collaborators (workload control API and registry),
//! configuration, and the small async building blocks every stage uses:
//! a cancellation signal and a bounded stage-level retry.
//!
//! With the `sim` feature, [`sim::SimulatedCluster`] provides an
//! in-memory implementation of both collaborators for tests.

pub mod cancel;
pub mod config;
pub mod control;
pub mod reference;
pub mod retry;
pub mod revision;
pub mod types;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use cancel::{CancelHandle, CancelToken};
pub use config::{ConfigError, OrchestratorConfig};
pub use control::{ControlError, Registry, RegistryError, WorkloadControl};
pub use reference::{Digest, ImageReference, ReferenceError};
pub use retry::{PollTracker, RetryDecision, RetryError, retry_call};
pub use revision::{REVISION_ANNOTATION, RevisionMarker};
pub use types::*;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
