//! Shared logging configuration and initialization.

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{optional_env, parse_flag, ResolvedJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Reads `METERPREP_LOG_LEVEL`, `METERPREP_LOG_FORMAT` and `METERPREP_LOG_TARGET`.
/// Unset, blank or unrecognized values keep the default.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: optional_env("METERPREP_LOG_LEVEL").unwrap_or(defaults.level),
        format: optional_env("METERPREP_LOG_FORMAT")
            .and_then(|raw| parse_log_format(&raw))
            .unwrap_or(defaults.format),
        include_target: optional_env("METERPREP_LOG_TARGET")
            .and_then(|raw| parse_flag(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_job_resolved(resolved: &ResolvedJob, warehouse_path: &Path, schema: &str) {
    info!(
        component = "prepare_training",
        event = "job.resolved",
        data_start = %resolved.job.data_start,
        data_end = %resolved.job.data_end,
        forecast_period_days = resolved.job.forecast_period_days,
        training_samples = resolved.job.training_samples,
        use_weather = resolved.job.use_weather,
        bucket = %resolved.bucket,
        output_prefix = %resolved.output_prefix,
        warehouse_path = %warehouse_path.display(),
        schema
    );
}

pub fn log_sink_selected(sink: &str, location: &str) {
    info!(
        component = "prepare_training",
        event = "sink.selected",
        sink,
        location
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}
