//! Logging initialization.
//!
//! JSON output for production, pretty printing for development. The
//! filter string follows `tracing_subscriber::EnvFilter` syntax, e.g.
//! `"info"` or `"infer_core=debug"`.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logging.
    #[default]
    Json,
    /// Human-readable output.
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directive, e.g. "info" or "infer_core=trace".
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

/// Errors that can occur during logging initialization.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("subscriber already initialized")]
    AlreadyInitialized,
}

/// Initialize the tracing subscriber. Call once at process startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter =
        EnvFilter::try_new(&config.level).map_err(|e| LogError::InvalidFilter(e.to_string()))?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json())
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty())
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized),
    }
}

/// Initialize from `INFER_CORE_LOG` / `INFER_CORE_LOG_FORMAT`.
///
/// `INFER_CORE_LOG` holds the filter directive (default "info");
/// `INFER_CORE_LOG_FORMAT=pretty` switches off JSON output.
pub fn init_logging_from_env() -> Result<(), LogError> {
    let level = std::env::var("INFER_CORE_LOG").unwrap_or_else(|_| "info".to_string());
    let format = match std::env::var("INFER_CORE_LOG_FORMAT").as_deref() {
        Ok("pretty") => LogFormat::Pretty,
        _ => LogFormat::Json,
    };
    init_logging(&LogConfig { format, level })
}
