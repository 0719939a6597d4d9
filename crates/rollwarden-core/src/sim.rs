//! In-memory cluster and registry for tests.
//!
//! `SimulatedCluster` implements both collaborator traits. Replica
//! progress is driven by state reads: every `get_workload_state` call is
//! one tick. Accepted updates become visible after `read_lag` ticks, which
//! models the eventually-consistent reads of a real API server. Attempt
//! leases expire on the tokio clock, so paused-time tests can age them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::control::*;
use crate::reference::{Digest, ImageReference};
use crate::revision::RevisionMarker;
use crate::types::*;

/// How a freshly created replica running a given image behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaBehavior {
    /// Becomes ready after this many state reads.
    ReadyAfter(u32),
    NeverReady,
    /// Restarts once per state read and never becomes ready.
    CrashLoop,
}

#[derive(Debug, Clone)]
struct SimReplica {
    status: ReplicaStatus,
    behavior: ReplicaBehavior,
    polls: u32,
}

#[derive(Debug, Default)]
struct SimWorkload {
    declared: u32,
    bounds: Option<ReplicaBounds>,
    replicas: Vec<SimReplica>,
    revision: Option<RevisionMarker>,
    /// Accepted updates not yet visible: (reads remaining, update).
    pending: VecDeque<(u32, WorkloadUpdate)>,
    /// Image of the last materialized update.
    image: Option<ImageReference>,
    next_replica: u32,
    /// Worst `declared - ready` seen after any change.
    peak_unavailable: u32,
    last_transition_at: u64,
}

#[derive(Debug, Clone)]
struct SimLease {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct SimInner {
    workloads: HashMap<WorkloadId, SimWorkload>,
    tags: HashMap<String, Digest>,
    behaviors: HashMap<String, ReplicaBehavior>,
    default_behavior: ReplicaBehavior,
    read_lag: u32,
    failing_state_reads: u32,
    failing_autoscale_reads: u32,
    failing_registry_reads: u32,
    reject_updates: Option<String>,
    autoscale_script: VecDeque<AutoscaleObservation>,
    last_autoscale: Option<AutoscaleObservation>,
    updates: Vec<WorkloadUpdate>,
    state_reads: u32,
    leases: HashMap<WorkloadId, SimLease>,
    lease_renewals: u32,
    clock: u64,
}

/// Scriptable stand-in for the cluster and the registry.
#[derive(Debug)]
pub struct SimulatedCluster {
    inner: Mutex<SimInner>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn behavior_key(image: &ImageReference) -> String {
    match image.digest() {
        Some(d) => d.to_string(),
        None => image.to_string(),
    }
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner {
                workloads: HashMap::new(),
                tags: HashMap::new(),
                behaviors: HashMap::new(),
                default_behavior: ReplicaBehavior::ReadyAfter(1),
                read_lag: 0,
                failing_state_reads: 0,
                failing_autoscale_reads: 0,
                failing_registry_reads: 0,
                reject_updates: None,
                autoscale_script: VecDeque::new(),
                last_autoscale: None,
                updates: Vec::new(),
                state_reads: 0,
                leases: HashMap::new(),
                lease_renewals: 0,
                clock: 1_000,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Scripting ──────────────────────────────────────────────────

    /// Seed a workload with `replicas` ready replicas running `image`.
    pub fn seed_workload(
        &self,
        id: &WorkloadId,
        image: &ImageReference,
        replicas: u32,
        revision: Option<RevisionMarker>,
    ) {
        let mut inner = self.lock();
        let workload = inner.workloads.entry(id.clone()).or_default();
        workload.declared = replicas;
        workload.revision = revision;
        workload.image = Some(image.clone());
        for _ in 0..replicas {
            let name = format!("{}-{}", id.name, workload.next_replica);
            workload.next_replica += 1;
            workload.replicas.push(SimReplica {
                status: ReplicaStatus {
                    name,
                    image: image.clone(),
                    ready: true,
                    restart_count: 0,
                },
                behavior: ReplicaBehavior::ReadyAfter(0),
                polls: 0,
            });
        }
    }

    /// Register a tag in the simulated registry.
    pub fn publish(&self, reference: &str, digest: &Digest) {
        let key = ImageReference::parse(reference)
            .map(|r| r.to_string())
            .unwrap_or_else(|_| reference.to_string());
        self.lock().tags.insert(key, digest.clone());
    }

    pub fn set_behavior(&self, image: &ImageReference, behavior: ReplicaBehavior) {
        self.lock().behaviors.insert(behavior_key(image), behavior);
    }

    pub fn set_default_behavior(&self, behavior: ReplicaBehavior) {
        self.lock().default_behavior = behavior;
    }

    /// Accepted updates become visible only after `reads` state reads.
    pub fn set_read_lag(&self, reads: u32) {
        self.lock().read_lag = reads;
    }

    pub fn fail_state_reads(&self, count: u32) {
        self.lock().failing_state_reads = count;
    }

    pub fn fail_autoscale_reads(&self, count: u32) {
        self.lock().failing_autoscale_reads = count;
    }

    pub fn fail_registry_reads(&self, count: u32) {
        self.lock().failing_registry_reads = count;
    }

    pub fn reject_updates(&self, reason: Option<&str>) {
        self.lock().reject_updates = reason.map(str::to_string);
    }

    /// Queue autoscaler snapshots; the last one repeats once drained.
    pub fn push_autoscale(&self, observation: AutoscaleObservation) {
        self.lock().autoscale_script.push_back(observation);
    }

    /// Hand the attempt lease for `id` to `holder`, as another
    /// orchestrator process would.
    pub fn hold_lease(&self, id: &WorkloadId, holder: &str, ttl: Duration) {
        self.lock().leases.insert(
            id.clone(),
            SimLease {
                holder: holder.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Current unexpired lease holder for `id`.
    pub fn lease_holder(&self, id: &WorkloadId) -> Option<String> {
        self.lock()
            .leases
            .get(id)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.holder.clone())
    }

    /// Claims that renewed a lease the caller already held.
    pub fn lease_renewals(&self) -> u32 {
        self.lock().lease_renewals
    }

    /// Number of accepted update requests.
    pub fn writes(&self) -> usize {
        self.lock().updates.len()
    }

    pub fn updates(&self) -> Vec<WorkloadUpdate> {
        self.lock().updates.clone()
    }

    pub fn state_reads(&self) -> u32 {
        self.lock().state_reads
    }

    /// Highest number of unavailable replicas observed for `id`.
    pub fn peak_unavailable(&self, id: &WorkloadId) -> u32 {
        self.lock()
            .workloads
            .get(id)
            .map(|w| w.peak_unavailable)
            .unwrap_or(0)
    }

    /// Current materialized state, without ticking.
    pub fn snapshot(&self, id: &WorkloadId) -> WorkloadState {
        let inner = self.lock();
        inner
            .workloads
            .get(id)
            .map(|w| w.state())
            .unwrap_or_default()
    }
}

impl SimWorkload {
    fn state(&self) -> WorkloadState {
        WorkloadState {
            declared_replicas: self.declared,
            replicas: self.replicas.iter().map(|r| r.status.clone()).collect(),
            revision: self.revision.clone(),
            last_transition_at: self.last_transition_at,
        }
    }

    fn unavailable(&self) -> u32 {
        let ready = self.replicas.iter().filter(|r| r.status.ready).count() as u32;
        self.declared.saturating_sub(ready)
    }

    fn observe(&mut self) {
        self.peak_unavailable = self.peak_unavailable.max(self.unavailable());
    }

    fn tick(&mut self) {
        for replica in &mut self.replicas {
            if replica.status.ready {
                continue;
            }
            replica.polls += 1;
            match replica.behavior {
                ReplicaBehavior::ReadyAfter(n) if replica.polls >= n => replica.status.ready = true,
                ReplicaBehavior::CrashLoop => replica.status.restart_count += 1,
                _ => {}
            }
        }
        self.retire_surplus();
        self.observe();
    }

    /// Drop surge replicas once the pool has more ready replicas than it
    /// declares. Old replicas go first.
    fn retire_surplus(&mut self) {
        while self.replicas.len() as u32 > self.declared {
            let ready = self.replicas.iter().filter(|r| r.status.ready).count() as u32;
            let old_not_ready = self.position_old(|r| !r.status.ready);
            let pos = match old_not_ready {
                Some(pos) => pos,
                None if ready > self.declared => match self.position_old(|_| true) {
                    Some(pos) => pos,
                    None => self.replicas.len() - 1,
                },
                None => break,
            };
            self.replicas.remove(pos);
        }
    }

    fn position_old(&self, pred: impl Fn(&SimReplica) -> bool) -> Option<usize> {
        let current = self.image.as_ref();
        self.replicas.iter().position(|r| {
            current.is_none_or(|img| !r.status.image.same_artifact(img)) && pred(r)
        })
    }

    fn materialize(&mut self, update: &WorkloadUpdate, behavior: ReplicaBehavior, now: u64) {
        let desired = &update.spec.image;
        self.declared = update.target_replicas;
        self.bounds = Some(update.spec.replicas);
        self.revision = Some(update.revision.clone());
        self.image = Some(desired.clone());
        self.last_transition_at = now;

        let on_new = self
            .replicas
            .iter()
            .filter(|r| r.status.image.same_artifact(desired))
            .count() as u32;
        let to_create = update.updated_replicas.saturating_sub(on_new);

        // Surge replicas come on top; the rest replace old ones right away.
        let mut to_retire = to_create.saturating_sub(update.surge);
        for _ in 0..to_create {
            self.spawn(&update.spec, behavior);
        }
        while to_retire > 0 {
            let pos = self
                .position_old(|r| !r.status.ready)
                .or_else(|| self.position_old(|_| true));
            let Some(pos) = pos else {
                break;
            };
            self.replicas.remove(pos);
            to_retire -= 1;
        }

        while (self.replicas.len() as u32) < update.target_replicas {
            self.spawn(&update.spec, behavior);
        }
        while (self.replicas.len() as u32) > update.target_replicas + update.surge {
            let pos = self
                .position_old(|_| true)
                .unwrap_or(self.replicas.len() - 1);
            self.replicas.remove(pos);
        }
        self.observe();
    }

    fn spawn(&mut self, spec: &WorkloadSpec, behavior: ReplicaBehavior) {
        let name = format!("{}-{}", spec.id.name, self.next_replica);
        self.next_replica += 1;
        self.replicas.push(SimReplica {
            status: ReplicaStatus {
                name,
                image: spec.image.clone(),
                ready: matches!(behavior, ReplicaBehavior::ReadyAfter(0)),
                restart_count: 0,
            },
            behavior,
            polls: 0,
        });
    }
}

#[async_trait]
impl WorkloadControl for SimulatedCluster {
    async fn get_workload_state(&self, id: &WorkloadId) -> Result<WorkloadState, ControlError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.state_reads += 1;
        inner.clock += 1;
        if inner.failing_state_reads > 0 {
            inner.failing_state_reads -= 1;
            return Err(ControlError::Unavailable("simulated read failure".to_string()));
        }

        let now = inner.clock;
        let Some(workload) = inner.workloads.get_mut(id) else {
            return Ok(WorkloadState::default());
        };
        workload.tick();

        let mut due = Vec::new();
        for (remaining, update) in workload.pending.iter_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                due.push(update.clone());
            }
        }
        workload.pending.retain(|(remaining, _)| *remaining > 0);
        for update in due {
            let behavior = inner
                .behaviors
                .get(&behavior_key(&update.spec.image))
                .copied()
                .unwrap_or(inner.default_behavior);
            workload.materialize(&update, behavior, now);
        }

        Ok(workload.state())
    }

    async fn apply_workload_update(
        &self,
        id: &WorkloadId,
        update: &WorkloadUpdate,
    ) -> Result<UpdateAck, ControlError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(reason) = &inner.reject_updates {
            return Ok(UpdateAck::Rejected(reason.clone()));
        }
        inner.updates.push(update.clone());
        debug!(
            workload = %id,
            updated = update.updated_replicas,
            target = update.target_replicas,
            "simulated update accepted"
        );

        let behavior = inner
            .behaviors
            .get(&behavior_key(&update.spec.image))
            .copied()
            .unwrap_or(inner.default_behavior);
        let now = inner.clock;
        let lag = inner.read_lag;
        let workload = inner.workloads.entry(id.clone()).or_default();
        if lag == 0 {
            workload.materialize(update, behavior, now);
        } else {
            workload.pending.push_back((lag, update.clone()));
        }
        Ok(UpdateAck::Accepted)
    }

    async fn get_autoscale_observation(
        &self,
        id: &WorkloadId,
    ) -> Result<AutoscaleObservation, ControlError> {
        let mut inner = self.lock();
        if inner.failing_autoscale_reads > 0 {
            inner.failing_autoscale_reads -= 1;
            return Err(ControlError::Unavailable("simulated autoscaler read failure".to_string()));
        }
        if let Some(next) = inner.autoscale_script.pop_front() {
            inner.last_autoscale = Some(next.clone());
            return Ok(next);
        }
        if let Some(last) = &inner.last_autoscale {
            return Ok(last.clone());
        }

        let (current, bounds) = inner
            .workloads
            .get(id)
            .map(|w| (w.replicas.len() as u32, w.bounds))
            .unwrap_or((0, None));
        let bounds = bounds.unwrap_or(ReplicaBounds {
            min: current,
            max: current,
        });
        Ok(AutoscaleObservation {
            current_replicas: current,
            min_replicas: bounds.min,
            max_replicas: bounds.max,
            cpu_utilization: Some(10),
            memory_utilization: Some(20),
            metrics_available: true,
        })
    }

    async fn acquire_lease(
        &self,
        id: &WorkloadId,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseAck, ControlError> {
        let mut inner = self.lock();
        let now = Instant::now();
        if let Some(lease) = inner.leases.get(id)
            && lease.expires_at > now
            && lease.holder != holder
        {
            return Ok(LeaseAck::Held {
                holder: lease.holder.clone(),
            });
        }
        let renewed = inner.leases.get(id).is_some_and(|l| l.holder == holder);
        if renewed {
            inner.lease_renewals += 1;
        }
        inner.leases.insert(
            id.clone(),
            SimLease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(LeaseAck::Acquired)
    }

    async fn release_lease(&self, id: &WorkloadId, holder: &str) -> Result<(), ControlError> {
        let mut inner = self.lock();
        if inner.leases.get(id).is_some_and(|l| l.holder == holder) {
            inner.leases.remove(id);
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for SimulatedCluster {
    async fn resolve_reference(&self, reference: &ImageReference) -> Result<Digest, RegistryError> {
        let mut inner = self.lock();
        if inner.failing_registry_reads > 0 {
            inner.failing_registry_reads -= 1;
            return Err(RegistryError::Unreachable("simulated registry outage".to_string()));
        }
        inner
            .tags
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))
    }
}
