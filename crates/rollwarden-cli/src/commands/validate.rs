use super::{OutputFormat, WorkloadArgs};
use crate::errors::{CliError, EXIT_OK};

/// Offline: no cluster or registry calls.
pub fn handle(args: &WorkloadArgs, output: OutputFormat) -> Result<i32, CliError> {
    let config = args.load()?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => {
            let rendered =
                toml::to_string_pretty(&config).map_err(|e| CliError::Config(e.to_string()))?;
            println!("# {} is valid", args.config.display());
            println!("{rendered}");
        }
    }
    Ok(EXIT_OK)
}
