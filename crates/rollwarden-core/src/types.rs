//! Data model shared by every stage of an orchestration run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::reference::ImageReference;
use crate::revision::RevisionMarker;

/// Identity of one deployable unit: `{namespace}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key used for identity-scoped bookkeeping.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ── Spec ───────────────────────────────────────────────────────────

/// Immutable input to one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub id: WorkloadId,
    /// Container within the pod template that carries the image.
    pub container: String,
    pub image: ImageReference,
    pub resources: ResourceRequirements,
    pub replicas: ReplicaBounds,
    pub strategy: RolloutStrategy,
}

impl WorkloadSpec {
    /// Replica count a rollout should converge on, given what the
    /// cluster currently declares.
    pub fn target_replicas(&self, declared: u32) -> u32 {
        if declared == 0 {
            self.replicas.min.max(1).min(self.replicas.max)
        } else {
            declared.clamp(self.replicas.min, self.replicas.max)
        }
    }
}

/// Requests and limits per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_request_millis: Option<u32>,
    pub cpu_limit_millis: Option<u32>,
    pub memory_request_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
}

/// Min/max replica count, shared with the autoscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaBounds {
    pub min: u32,
    pub max: u32,
}

impl ReplicaBounds {
    pub fn contains(&self, replicas: u32) -> bool {
        (self.min..=self.max).contains(&replicas)
    }
}

/// Rolling update budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStrategy {
    pub max_unavailable: Budget,
    pub max_surge: Budget,
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self {
            max_unavailable: Budget::Percent(25),
            max_surge: Budget::Percent(25),
        }
    }
}

/// A replica budget, either absolute or a share of the replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BudgetValue", into = "BudgetValue")]
pub enum Budget {
    Count(u32),
    Percent(u32),
}

impl Budget {
    /// Resolve against `replicas`. Percentages round up, never beyond
    /// `replicas`.
    pub fn resolve(&self, replicas: u32) -> u32 {
        match *self {
            Budget::Count(n) => n.min(replicas),
            Budget::Percent(p) => {
                let scaled = (u64::from(replicas) * u64::from(p)).div_ceil(100);
                (scaled as u32).min(replicas)
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Budget::Count(0) | Budget::Percent(0))
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Budget::Count(n) => write!(f, "{n}"),
            Budget::Percent(p) => write!(f, "{p}%"),
        }
    }
}

impl FromStr for Budget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(p) = s.strip_suffix('%') {
            let p: u32 = p.trim().parse().map_err(|_| format!("invalid percentage: {s}"))?;
            if p > 100 {
                return Err(format!("percentage above 100: {s}"));
            }
            Ok(Budget::Percent(p))
        } else {
            s.parse()
                .map(Budget::Count)
                .map_err(|_| format!("invalid budget: {s}"))
        }
    }
}

/// Wire form of a budget: `1` or `"25%"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BudgetValue {
    Count(u32),
    Text(String),
}

impl TryFrom<BudgetValue> for Budget {
    type Error = String;

    fn try_from(value: BudgetValue) -> Result<Self, Self::Error> {
        match value {
            BudgetValue::Count(n) => Ok(Budget::Count(n)),
            BudgetValue::Text(s) => s.parse(),
        }
    }
}

impl From<Budget> for BudgetValue {
    fn from(b: Budget) -> Self {
        match b {
            Budget::Count(n) => BudgetValue::Count(n),
            Budget::Percent(_) => BudgetValue::Text(b.to_string()),
        }
    }
}

// ── Observed state ─────────────────────────────────────────────────

/// Observed runtime state of a workload. Produced by the cluster only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadState {
    /// Replica count the cluster currently declares (0 if absent).
    pub declared_replicas: u32,
    pub replicas: Vec<ReplicaStatus>,
    /// Revision marker of the last applied spec, if any.
    pub revision: Option<RevisionMarker>,
    /// Unix timestamp of the last observed state transition.
    pub last_transition_at: u64,
}

impl WorkloadState {
    pub fn ready_count(&self) -> u32 {
        self.replicas.iter().filter(|r| r.ready).count() as u32
    }

    /// Replicas running `image`.
    pub fn running<'a>(
        &'a self,
        image: &'a ImageReference,
    ) -> impl Iterator<Item = &'a ReplicaStatus> + 'a {
        self.replicas.iter().filter(move |r| r.image.same_artifact(image))
    }

    /// Ready replicas running `image`.
    pub fn ready_on(&self, image: &ImageReference) -> u32 {
        self.running(image).filter(|r| r.ready).count() as u32
    }
}

/// One running replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub name: String,
    pub image: ImageReference,
    pub ready: bool,
    pub restart_count: u32,
}

/// Snapshot of the horizontal autoscaler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoscaleObservation {
    pub current_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub cpu_utilization: Option<u32>,
    pub memory_utilization: Option<u32>,
    pub metrics_available: bool,
}

impl AutoscaleObservation {
    /// Highest reported utilization percentage.
    pub fn peak_utilization(&self) -> Option<u32> {
        match (self.cpu_utilization, self.memory_utilization) {
            (Some(c), Some(m)) => Some(c.max(m)),
            (c, m) => c.or(m),
        }
    }
}

// ── Writes ─────────────────────────────────────────────────────────

/// One update request: move `updated_replicas` of `target_replicas` onto
/// the spec's image, surging by at most `surge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadUpdate {
    pub spec: WorkloadSpec,
    pub revision: RevisionMarker,
    pub target_replicas: u32,
    pub updated_replicas: u32,
    pub surge: u32,
}

/// Answer of the control API to an update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAck {
    Accepted,
    Rejected(String),
}

/// Answer of the control API to a lease claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAck {
    /// The caller holds the lease until it expires or is released.
    Acquired,
    /// Someone else holds an unexpired lease.
    Held { holder: String },
}
