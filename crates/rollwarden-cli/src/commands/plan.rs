use rollwarden_orchestrator::PlanReport;
use rollwarden_rollout::Decision;

use super::{OutputFormat, WorkloadArgs, cancel_on_ctrl_c, connect};
use crate::errors::{CliError, EXIT_OK};

pub async fn handle(args: &WorkloadArgs, output: OutputFormat) -> Result<i32, CliError> {
    let config = args.load()?;
    let orchestrator = connect(&config).await?;
    let report = orchestrator.plan(&config, cancel_on_ctrl_c()).await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!("{}", render(&report)),
    }
    Ok(EXIT_OK)
}

fn render(report: &PlanReport) -> String {
    let mut lines = vec![
        format!("workload:   {}", report.workload),
        format!("resolved:   {}", report.resolved),
    ];
    match &report.decision {
        Decision::NoChangeNeeded => lines.push("decision:   no change needed".to_string()),
        Decision::RolloutRequired { reason } => {
            lines.push(format!("decision:   rollout required ({reason})"));
        }
    }
    if let Some(plan) = &report.plan {
        lines.push(format!(
            "replicas:   {} ({} already updated)",
            plan.target_replicas, plan.already_updated
        ));
        lines.push(format!(
            "budget:     max unavailable {}, max surge {}",
            plan.max_unavailable, plan.max_surge
        ));
        for step in &plan.steps {
            lines.push(format!(
                "  batch {}: surge {}, unavailable {}, {} updated after",
                step.index, step.surge, step.unavailable, step.updated_after
            ));
        }
    }
    lines.join("\n")
}
