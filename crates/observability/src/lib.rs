//! Tracing and logging (shared setup).

/// Logging configuration and subscriber installation.
pub mod logging;

pub use logging::{LogConfig, LogFormat, ObservabilityError, init};
