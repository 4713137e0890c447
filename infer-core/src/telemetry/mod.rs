//! Telemetry for the serving runtime.
//!
//! Structured logging only; performance counters ride on packages as an
//! optional per-stage wall-time map and are surfaced by the completion
//! callbacks.

mod logging;

pub use logging::{init_logging, init_logging_from_env, LogConfig, LogError, LogFormat};
