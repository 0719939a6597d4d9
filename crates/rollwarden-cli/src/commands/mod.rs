use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::debug;

use rollwarden_core::config::parse_duration;
use rollwarden_core::{Budget, CancelHandle, CancelToken, ImageReference, OrchestratorConfig};
use rollwarden_kube::KubeControl;
use rollwarden_orchestrator::Orchestrator;
use rollwarden_registry::HttpRegistry;

use crate::errors::CliError;

pub mod deploy;
pub mod plan;
pub mod status;
pub mod validate;

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "rollwarden",
    about = "Roll a container image out to a Kubernetes workload and confirm it settles",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Report format on stdout.
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub output: OutputFormat,

    /// Log format on stderr.
    #[arg(long, value_enum, default_value = "text", global = true, env = "ROLLWARDEN_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// More log detail for rollwarden crates (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Resolve the image, roll it out, verify health and autoscaling.
    ///
    /// Exit status: 0 succeeded or nothing to do, 3 succeeded with a
    /// warning, 1 failed, 4 another run holds the workload, 10 bad
    /// configuration, 130 cancelled.
    Deploy(WorkloadArgs),
    /// Show what `deploy` would do, without writing anything.
    Plan(WorkloadArgs),
    /// Show the workload's replicas, revision, and autoscaler.
    Status(WorkloadArgs),
    /// Check the configuration and print the effective settings.
    Validate(WorkloadArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Config file plus per-invocation overrides.
#[derive(Debug, Args)]
pub struct WorkloadArgs {
    /// Path to rollwarden.toml.
    #[arg(short, long, env = "ROLLWARDEN_CONFIG", default_value = "rollwarden.toml")]
    pub config: PathBuf,

    /// Workload namespace.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Workload name.
    #[arg(long)]
    pub name: Option<String>,

    /// Full image reference to deploy.
    #[arg(long, conflicts_with = "tag")]
    pub image: Option<String>,

    /// Tag to deploy from the configured repository.
    #[arg(long)]
    pub tag: Option<String>,

    /// Replicas that may be unavailable during the rollout (`1` or `25%`).
    #[arg(long)]
    pub max_unavailable: Option<Budget>,

    /// Replicas allowed above the target during the rollout (`1` or `25%`).
    #[arg(long)]
    pub max_surge: Option<Budget>,

    /// Whole-attempt limit.
    #[arg(long)]
    pub attempts: Option<u32>,

    /// Time one batch has to become ready (e.g. `90s`, `2m`).
    #[arg(long, value_parser = duration_arg)]
    pub batch_timeout: Option<Duration>,

    /// Deadline for post-rollout health verification.
    #[arg(long, value_parser = duration_arg)]
    pub health_deadline: Option<Duration>,

    /// Registry reached over plain HTTP. Repeatable.
    #[arg(long = "insecure-registry")]
    pub insecure_registries: Vec<String>,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration: {s}"))
}

impl WorkloadArgs {
    /// Load the config file, apply overrides, validate.
    pub fn load(&self) -> Result<OrchestratorConfig, CliError> {
        let mut config = OrchestratorConfig::from_file(&self.config)
            .map_err(|e| CliError::Config(e.to_string()))?;
        self.apply(&mut config)?;
        config
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;
        debug!(config = %self.config.display(), workload = %config.workload_id(), "configuration loaded");
        Ok(config)
    }

    fn apply(&self, config: &mut OrchestratorConfig) -> Result<(), CliError> {
        if let Some(ns) = &self.namespace {
            config.workload.namespace = ns.clone();
        }
        if let Some(name) = &self.name {
            config.workload.name = name.clone();
        }
        if let Some(image) = &self.image {
            config.workload.image = image.clone();
        }
        if let Some(tag) = &self.tag {
            let retagged = ImageReference::parse(&config.workload.image)
                .and_then(|r| r.with_tag(tag))
                .map_err(|e| CliError::Config(e.to_string()))?;
            config.workload.image = retagged.to_string();
        }
        if let Some(b) = self.max_unavailable {
            config.rollout.max_unavailable = b;
        }
        if let Some(b) = self.max_surge {
            config.rollout.max_surge = b;
        }
        if let Some(n) = self.attempts {
            config.retry.max_attempts = n;
        }
        if let Some(d) = self.batch_timeout {
            config.rollout.batch_timeout = d;
        }
        if let Some(d) = self.health_deadline {
            config.health.deadline = d;
        }
        config
            .registry
            .insecure
            .extend(self.insecure_registries.iter().cloned());
        Ok(())
    }
}

/// Connect both collaborators.
pub async fn connect(config: &OrchestratorConfig) -> Result<Orchestrator, CliError> {
    let control = KubeControl::try_default()
        .await
        .map_err(|e| CliError::Cluster(e.to_string()))?;
    let registry = HttpRegistry::new(config.registry.insecure.clone(), REGISTRY_TIMEOUT)
        .map_err(|e| CliError::Registry(e.to_string()))?;
    Ok(Orchestrator::new(Arc::new(control), Arc::new(registry)))
}

/// A cancel token flipped by Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancelToken {
    let handle = CancelHandle::new();
    let token = handle.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling after the current poll");
            handle.cancel();
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[workload]
name = "app"
image = "ghcr.io/acme/app:v1"
"#;

    fn args(extra: &[&str]) -> WorkloadArgs {
        let mut argv = vec!["rollwarden", "deploy"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Deploy(a) => a,
            _ => unreachable!(),
        }
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut config = OrchestratorConfig::from_toml(CONFIG).unwrap();
        args(&[
            "--tag",
            "v2",
            "--namespace",
            "web",
            "--max-unavailable",
            "0",
            "--max-surge",
            "50%",
            "--attempts",
            "5",
            "--batch-timeout",
            "90s",
        ])
        .apply(&mut config)
        .unwrap();

        assert_eq!(config.workload.image, "ghcr.io/acme/app:v2");
        assert_eq!(config.workload.namespace, "web");
        assert_eq!(config.rollout.max_unavailable, Budget::Count(0));
        assert_eq!(config.rollout.max_surge, Budget::Percent(50));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.rollout.batch_timeout, Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn image_and_tag_conflict() {
        let parsed = Cli::try_parse_from([
            "rollwarden", "deploy", "--image", "acme/app:v3", "--tag", "v2",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn bad_duration_is_a_usage_error() {
        let parsed = Cli::try_parse_from(["rollwarden", "plan", "--batch-timeout", "soon"]);
        assert!(parsed.is_err());
    }
}
