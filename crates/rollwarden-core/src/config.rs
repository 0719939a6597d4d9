//! `rollwarden.toml` configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reference::{ImageReference, ReferenceError};
use crate::types::*;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid image reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub autoscale: AutoscaleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Desired image, tag or digest form.
    pub image: String,
    /// Container carrying the image; defaults to the workload name.
    pub container: Option<String>,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub replicas: ReplicasConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicasConfig {
    pub min: u32,
    pub max: u32,
}

impl Default for ReplicasConfig {
    fn default() -> Self {
        Self { min: 1, max: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub max_unavailable: Budget,
    pub max_surge: Budget,
    /// Time one batch has to become ready.
    #[serde(with = "duration_str")]
    pub batch_timeout: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_unavailable: Budget::Percent(25),
            max_surge: Budget::Percent(25),
            batch_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Overall deadline for post-rollout verification.
    #[serde(with = "duration_str")]
    pub deadline: Duration,
    /// A not-ready replica restarted more than this many times counts as
    /// crash-looping.
    pub restart_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            deadline: Duration::from_secs(300),
            restart_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// Utilization percentage above which the autoscaler scales up.
    pub scale_up_threshold: u32,
    #[serde(with = "duration_str")]
    pub sample_interval: Duration,
    /// Confirmation window after rollout.
    #[serde(with = "duration_str")]
    pub window: Duration,
    /// How long missing metrics are expected after a rollout.
    #[serde(with = "duration_str")]
    pub metrics_grace: Duration,
    /// Consecutive in-bounds samples required to call it stable.
    pub stable_samples: u32,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            scale_up_threshold: 80,
            sample_interval: Duration::from_secs(15),
            window: Duration::from_secs(120),
            metrics_grace: Duration::from_secs(60),
            stable_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Whole-attempt limit.
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    /// Consecutive failed calls tolerated inside one stage.
    pub poll_retries: u32,
    #[serde(with = "duration_str")]
    pub poll_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            poll_retries: 3,
            poll_backoff: Duration::from_millis(500),
        }
    }
}

/// The cluster-side lease that keeps one attempt per workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a claim stays valid without renewal. Renewed every third
    /// of this while the attempt runs; a crashed run frees the workload
    /// once it lapses.
    #[serde(with = "duration_str")]
    pub duration: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registries reached over plain HTTP.
    pub insecure: Vec<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn workload_id(&self) -> WorkloadId {
        WorkloadId::new(&self.workload.namespace, &self.workload.name)
    }

    /// Reject anything that would only surface as a runtime surprise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.workload;
        if w.name.trim().is_empty() {
            return Err(invalid("workload.name", "must not be empty"));
        }
        if w.namespace.trim().is_empty() {
            return Err(invalid("workload.namespace", "must not be empty"));
        }
        ImageReference::parse(&w.image)?;
        if w.replicas.max == 0 {
            return Err(invalid("workload.replicas.max", "must be at least 1"));
        }
        if w.replicas.min > w.replicas.max {
            return Err(invalid(
                "workload.replicas",
                format!("min {} exceeds max {}", w.replicas.min, w.replicas.max),
            ));
        }
        self.resources()?;

        let r = &self.rollout;
        if r.max_unavailable.is_zero() && r.max_surge.is_zero() {
            return Err(invalid(
                "rollout",
                "max_unavailable and max_surge cannot both be zero",
            ));
        }
        if r.batch_timeout.is_zero() {
            return Err(invalid("rollout.batch_timeout", "must be positive"));
        }

        let h = &self.health;
        if h.interval.is_zero() {
            return Err(invalid("health.interval", "must be positive"));
        }
        if h.deadline < h.interval {
            return Err(invalid("health.deadline", "shorter than health.interval"));
        }
        if h.restart_threshold == 0 {
            return Err(invalid("health.restart_threshold", "must be at least 1"));
        }

        let a = &self.autoscale;
        // The autoscaler works in whole percent; anything outside 1..=100
        // can never be reached or never be exceeded.
        if !(1..=100).contains(&a.scale_up_threshold) {
            return Err(invalid(
                "autoscale.scale_up_threshold",
                format!("{} is outside 1..=100", a.scale_up_threshold),
            ));
        }
        if a.sample_interval.is_zero() {
            return Err(invalid("autoscale.sample_interval", "must be positive"));
        }
        if a.window < a.sample_interval {
            return Err(invalid("autoscale.window", "shorter than autoscale.sample_interval"));
        }
        if a.stable_samples == 0 {
            return Err(invalid("autoscale.stable_samples", "must be at least 1"));
        }

        let t = &self.retry;
        if t.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if t.max_backoff < t.initial_backoff {
            return Err(invalid("retry.max_backoff", "shorter than retry.initial_backoff"));
        }

        if self.lease.duration < Duration::from_secs(3) {
            return Err(invalid("lease.duration", "must be at least 3s"));
        }
        Ok(())
    }

    pub fn resources(&self) -> Result<ResourceRequirements, ConfigError> {
        let r = &self.workload.resources;
        let cpu = |field: &'static str, v: &Option<String>| {
            v.as_deref()
                .map(|s| parse_cpu_millis(s).ok_or_else(|| invalid(field, format!("bad CPU quantity {s:?}"))))
                .transpose()
        };
        let mem = |field: &'static str, v: &Option<String>| {
            v.as_deref()
                .map(|s| parse_memory_bytes(s).ok_or_else(|| invalid(field, format!("bad memory quantity {s:?}"))))
                .transpose()
        };
        let req = ResourceRequirements {
            cpu_request_millis: cpu("workload.resources.cpu_request", &r.cpu_request)?,
            cpu_limit_millis: cpu("workload.resources.cpu_limit", &r.cpu_limit)?,
            memory_request_bytes: mem("workload.resources.memory_request", &r.memory_request)?,
            memory_limit_bytes: mem("workload.resources.memory_limit", &r.memory_limit)?,
        };
        if let (Some(request), Some(limit)) = (req.cpu_request_millis, req.cpu_limit_millis)
            && request > limit
        {
            return Err(invalid("workload.resources", "cpu_request exceeds cpu_limit"));
        }
        if let (Some(request), Some(limit)) = (req.memory_request_bytes, req.memory_limit_bytes)
            && request > limit
        {
            return Err(invalid("workload.resources", "memory_request exceeds memory_limit"));
        }
        Ok(req)
    }

    /// Build the run's spec around an already-resolved image.
    pub fn workload_spec(&self, image: ImageReference) -> Result<WorkloadSpec, ConfigError> {
        Ok(WorkloadSpec {
            id: self.workload_id(),
            container: self
                .workload
                .container
                .clone()
                .unwrap_or_else(|| self.workload.name.clone()),
            image,
            resources: self.resources()?,
            replicas: ReplicaBounds {
                min: self.workload.replicas.min,
                max: self.workload.replicas.max,
            },
            strategy: RolloutStrategy {
                max_unavailable: self.rollout.max_unavailable,
                max_surge: self.rollout.max_surge,
            },
        })
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h". A bare number
/// is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration in the shortest unit `parse_duration` reads back.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        format!("{ms}ms")
    } else if ms % 60_000 != 0 || ms == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}m", ms / 60_000)
    }
}

/// Parse a CPU quantity into millicores: "250m", "1", "0.5".
pub fn parse_cpu_millis(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(m) = s.strip_suffix('m') {
        return m.parse().ok();
    }
    let cores: f64 = s.parse().ok()?;
    if !cores.is_finite() || cores < 0.0 {
        return None;
    }
    Some((cores * 1000.0).round() as u32)
}

/// Parse a memory quantity into bytes: "134217728", "128Mi", "1G".
pub fn parse_memory_bytes(s: &str) -> Option<u64> {
    const UNITS: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let s = s.trim();
    for (suffix, factor) in UNITS {
        if let Some(n) = s.strip_suffix(suffix) {
            return n.trim().parse::<u64>().ok()?.checked_mul(*factor);
        }
    }
    s.parse().ok()
}

/// Serde adapter for human-readable durations.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid duration: {raw:?}")))
    }
}
