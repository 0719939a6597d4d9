//! CLI errors and process exit codes. Bad arguments exit with clap's
//! own code, 2.

use thiserror::Error;

use rollwarden_orchestrator::{OrchestrationError, Outcome, Warning};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_WARNING: i32 = 3;
pub const EXIT_IN_PROGRESS: i32 = 4;
pub const EXIT_CONFIG: i32 = 10;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    pub fn code(&self) -> i32 {
        match self {
            CliError::Config(_) => EXIT_CONFIG,
            CliError::Orchestration(e) => match e {
                OrchestrationError::AlreadyInProgress(_) => EXIT_IN_PROGRESS,
                OrchestrationError::InvalidConfig(_) => EXIT_CONFIG,
                OrchestrationError::Cancelled => EXIT_CANCELLED,
                _ => EXIT_FAILURE,
            },
            CliError::Cluster(_) | CliError::Registry(_) | CliError::Output(_) => EXIT_FAILURE,
        }
    }
}

/// Exit status for a finished run. A missing-metrics warning and an
/// elevated-utilization warning both count as success with warning.
pub fn outcome_code(outcome: &Outcome) -> i32 {
    match outcome {
        Outcome::NoChangeNeeded | Outcome::Succeeded => EXIT_OK,
        Outcome::SucceededWithWarning(Warning::MetricsUnavailable { .. } | Warning::Elevated { .. }) => {
            EXIT_WARNING
        }
        Outcome::Failed(_) => EXIT_FAILURE,
        Outcome::Cancelled => EXIT_CANCELLED,
    }
}
