//! Tracing subscriber setup: stderr always, a daily-rolling file when configured.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "inbox_triage=info";

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), config.filter.as_deref())?;

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|error| {
                Error::Config(format!(
                    "failed to create log directory {}: {error}",
                    directory.display()
                ))
            })?;
            let appender = tracing_appender::rolling::daily(directory, "inbox-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(file_layer)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing: {error}"))?;

    Ok(guard)
}

/// `RUST_LOG` wins over the configured directive, which wins over the default.
fn build_filter(env: Option<&str>, configured: Option<&str>) -> Result<EnvFilter> {
    let directive = env
        .filter(|value| !value.trim().is_empty())
        .or(configured)
        .unwrap_or(DEFAULT_FILTER);

    EnvFilter::try_new(directive)
        .map_err(|error| Error::Config(format!("invalid log filter '{directive}': {error}")))
}
