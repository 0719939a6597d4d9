//! Identity-keyed attempt locks.
//!
//! Two concurrent rollouts against one workload would each respect the
//! unavailable budget on their own and break it together, so a second
//! request for a held identity fails fast instead of waiting.
//!
//! Two layers: [`IdentityLocks`] guards orchestrators sharing a process,
//! and [`AttemptLease`] claims a lease stored with the cluster, which is
//! what keeps separate `rollwarden` invocations apart.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use rollwarden_core::config::{OrchestratorConfig, format_duration};
use rollwarden_core::{
    CancelToken, ControlError, LeaseAck, PollTracker, RetryError, WorkloadControl, WorkloadId,
    epoch_secs, retry_call,
};

use crate::error::OrchestrationError;

/// Shared set of identities with an attempt in flight.
#[derive(Debug, Clone, Default)]
pub struct IdentityLocks {
    /// Identity → acquisition time (epoch seconds).
    held: Arc<DashMap<WorkloadId, u64>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, id: &WorkloadId) -> Result<IdentityGuard, OrchestrationError> {
        match self.held.entry(id.clone()) {
            Entry::Occupied(held) => {
                debug!(workload = %id, since = *held.get(), "identity already locked");
                Err(OrchestrationError::AlreadyInProgress(id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(epoch_secs());
                debug!(workload = %id, "identity locked");
                Ok(IdentityGuard {
                    held: self.held.clone(),
                    id: id.clone(),
                })
            }
        }
    }

    pub fn is_held(&self, id: &WorkloadId) -> bool {
        self.held.contains_key(id)
    }
}

/// Releases the identity on drop.
#[derive(Debug)]
pub struct IdentityGuard {
    held: Arc<DashMap<WorkloadId, u64>>,
    id: WorkloadId,
}

impl IdentityGuard {
    pub fn id(&self) -> &WorkloadId {
        &self.id
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        self.held.remove(&self.id);
        debug!(workload = %self.id, "identity released");
    }
}

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lease holder name, unique per orchestrator instance: host, pid, start
/// time and an in-process sequence number.
pub fn default_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "rollwarden".to_string());
    format!(
        "{host}-{}-{}-{}",
        std::process::id(),
        epoch_secs(),
        HOLDER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// A claimed cluster-side lease, renewed in the background every third
/// of its duration until released.
pub struct AttemptLease {
    control: Arc<dyn WorkloadControl>,
    id: WorkloadId,
    holder: String,
    renewal: JoinHandle<()>,
}

impl AttemptLease {
    /// Claim the lease for `id`. A lease held by anyone else is
    /// `AlreadyInProgress`; transient API failures get the stage-level
    /// retry budget.
    pub async fn claim(
        control: Arc<dyn WorkloadControl>,
        config: &OrchestratorConfig,
        id: &WorkloadId,
        holder: &str,
        cancel: &mut CancelToken,
    ) -> Result<Self, OrchestrationError> {
        let ttl = config.lease.duration;
        let mut tracker = PollTracker::new(config.retry.poll_retries, config.retry.poll_backoff);
        let ack = retry_call(&mut tracker, cancel, ControlError::is_transient, || {
            control.acquire_lease(id, holder, ttl)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(e) => OrchestrationError::Cluster(e.to_string()),
            RetryError::Cancelled => OrchestrationError::Cancelled,
        })?;

        if let LeaseAck::Held { holder: other } = ack {
            debug!(workload = %id, holder = %other, "attempt lease held elsewhere");
            return Err(OrchestrationError::AlreadyInProgress(id.clone()));
        }
        debug!(workload = %id, %holder, ttl = %format_duration(ttl), "attempt lease acquired");

        let renewal = tokio::spawn(renew(control.clone(), id.clone(), holder.to_string(), ttl));
        Ok(Self {
            control,
            id: id.clone(),
            holder: holder.to_string(),
            renewal,
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Stop renewing and give the lease back. A failed release only
    /// delays the next claim until the lease lapses.
    pub async fn release(&self) {
        self.renewal.abort();
        match self.control.release_lease(&self.id, &self.holder).await {
            Ok(()) => debug!(workload = %self.id, "attempt lease released"),
            Err(e) => warn!(workload = %self.id, error = %e, "failed to release attempt lease"),
        }
    }
}

impl Drop for AttemptLease {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

async fn renew(control: Arc<dyn WorkloadControl>, id: WorkloadId, holder: String, ttl: Duration) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match control.acquire_lease(&id, &holder, ttl).await {
            Ok(LeaseAck::Acquired) => debug!(workload = %id, "attempt lease renewed"),
            Ok(LeaseAck::Held { holder: other }) => {
                warn!(workload = %id, holder = %other, "attempt lease taken over")
            }
            Err(e) => warn!(workload = %id, error = %e, "failed to renew attempt lease"),
        }
    }
}
