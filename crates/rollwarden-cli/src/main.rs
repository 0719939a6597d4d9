//! rollwarden — roll a container image out to a Kubernetes workload.
//!
//! Resolves the requested tag to a digest, skips the rollout when the
//! workload already runs it, otherwise replaces replicas in budgeted
//! batches, verifies health, and watches the autoscaler settle.
//!
//! # Usage
//!
//! ```text
//! rollwarden deploy --config rollwarden.toml --tag v2.3.1
//! rollwarden plan --config rollwarden.toml --output json
//! rollwarden status --namespace web --name api
//! rollwarden validate
//! ```

mod commands;
mod errors;
mod logging;

use std::process;

use clap::Parser;
use tracing::{Instrument, debug, info_span};

use commands::{Cli, Command};
use errors::{CliError, EXIT_FAILURE};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init_logging(cli.verbose, cli.log_format) {
        eprintln!("error: failed to initialise logging: {e}");
        process::exit(EXIT_FAILURE);
    }

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            e.code()
        }
    };
    debug!(exit_code = code, "rollwarden finished");
    process::exit(code);
}

async fn dispatch(cli: &Cli) -> Result<i32, CliError> {
    match &cli.command {
        Command::Deploy(args) => {
            commands::deploy::handle(args, cli.output)
                .instrument(info_span!("deploy"))
                .await
        }
        Command::Plan(args) => {
            commands::plan::handle(args, cli.output)
                .instrument(info_span!("plan"))
                .await
        }
        Command::Status(args) => {
            commands::status::handle(args, cli.output)
                .instrument(info_span!("status"))
                .await
        }
        Command::Validate(args) => commands::validate::handle(args, cli.output),
    }
}
