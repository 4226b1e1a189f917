use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{ExporterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Compact human-readable lines
    Logfmt,
    /// One JSON object per line
    Json,
}

/// Sets up the logging subscriber for the exporter.
///
/// # Arguments
/// * `level` - Default filter directive, used when `RUST_LOG` is not set
/// * `format` - Output format
pub fn init_logger(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            ExporterError::Configuration(format!("invalid log level {}: {}", level, e))
        })?,
    };

    let fmt_layer = match format {
        LogFormat::Logfmt => fmt::layer()
            .with_target(false)
            .with_level(true)
            .compact()
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ExporterError::Internal(format!("Failed to initialize logger: {}", e)))
}
