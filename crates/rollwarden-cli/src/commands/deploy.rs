use tracing::info;

use rollwarden_orchestrator::DeploymentReport;

use super::{OutputFormat, WorkloadArgs, cancel_on_ctrl_c, connect};
use crate::errors::{CliError, outcome_code};

pub async fn handle(args: &WorkloadArgs, output: OutputFormat) -> Result<i32, CliError> {
    let config = args.load()?;
    let orchestrator = connect(&config).await?;
    let report = orchestrator
        .orchestrate(&config, cancel_on_ctrl_c())
        .await?;
    print_report(&report, output)?;

    let code = outcome_code(&report.outcome);
    info!(
        workload = %report.workload,
        outcome = %report.outcome,
        attempts = report.attempts.len(),
        exit_code = code,
        "deploy finished"
    );
    Ok(code)
}

pub fn print_report(report: &DeploymentReport, output: OutputFormat) -> Result<(), CliError> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => println!("{}", report.render()),
    }
    Ok(())
}
