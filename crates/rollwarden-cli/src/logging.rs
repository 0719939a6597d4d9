use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::LogFormat;

/// Logs go to stderr; stdout carries the report.
pub fn init_logging(verbose: u8, format: LogFormat) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "info,rollwarden=debug",
        _ => "debug,rollwarden=trace",
    };
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer()
        .with_target(verbose > 0)
        .with_timer(fmt::time::uptime())
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env)
            .with(base.json())
            .try_init()?,
        LogFormat::Text => tracing_subscriber::registry()
            .with(env)
            .with(base.compact())
            .try_init()?,
    }
    Ok(())
}
