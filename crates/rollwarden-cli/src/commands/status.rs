use rollwarden_orchestrator::StatusReport;

use super::{OutputFormat, WorkloadArgs, cancel_on_ctrl_c, connect};
use crate::errors::{CliError, EXIT_OK};

pub async fn handle(args: &WorkloadArgs, output: OutputFormat) -> Result<i32, CliError> {
    let config = args.load()?;
    let orchestrator = connect(&config).await?;
    let report = orchestrator.status(&config, cancel_on_ctrl_c()).await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!("{}", render(&report)),
    }
    Ok(EXIT_OK)
}

fn render(report: &StatusReport) -> String {
    let state = &report.state;
    let mut lines = vec![
        format!("workload:   {}", report.workload),
        format!(
            "revision:   {}",
            state.revision.as_ref().map_or("-".to_string(), |r| r.to_string())
        ),
        format!(
            "replicas:   {}/{} ready ({} declared)",
            state.ready_count(),
            state.replicas.len(),
            state.declared_replicas
        ),
    ];
    for r in &state.replicas {
        lines.push(format!(
            "  {:<32} {:<9} restarts {:<3} {}",
            r.name,
            if r.ready { "ready" } else { "not ready" },
            r.restart_count,
            r.image
        ));
    }
    match &report.autoscale {
        Some(obs) if obs.metrics_available => lines.push(format!(
            "autoscale:  {} replicas in [{}, {}], cpu {}, memory {}",
            obs.current_replicas,
            obs.min_replicas,
            obs.max_replicas,
            percent(obs.cpu_utilization),
            percent(obs.memory_utilization)
        )),
        Some(obs) => lines.push(format!(
            "autoscale:  {} replicas in [{}, {}], metrics unavailable",
            obs.current_replicas, obs.min_replicas, obs.max_replicas
        )),
        None => lines.push("autoscale:  -".to_string()),
    }
    lines.join("\n")
}

fn percent(v: Option<u32>) -> String {
    v.map_or("-".to_string(), |v| format!("{v}%"))
}
