//! Structured logging setup.
//!
//! JSON lines by default, human-readable output for local runs. The filter
//! comes from `RUST_LOG` when set, otherwise from the configured default.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(ObservabilityError::InvalidFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("unknown log format: {0}")]
    InvalidFormat(String),
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    /// A global subscriber is already installed.
    #[error("logging already initialized")]
    AlreadyInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Route output through the test harness capture.
    #[serde(default)]
    pub test_writer: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: "info".to_string(),
            test_writer: false,
        }
    }
}

impl LogConfig {
    /// Read `COURSEFORGE_LOG_FORMAT` and `COURSEFORGE_LOG_LEVEL`.
    pub fn from_env() -> Result<Self, ObservabilityError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ObservabilityError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(format) = lookup("COURSEFORGE_LOG_FORMAT") {
            cfg.format = format.parse()?;
        }
        if let Some(level) = lookup("COURSEFORGE_LOG_LEVEL") {
            let level = level.trim();
            if !level.is_empty() {
                cfg.default_filter = level.to_string();
            }
        }
        Ok(cfg)
    }

    /// Pretty output captured by the test harness, `debug` for this workspace.
    pub fn for_tests() -> Self {
        Self {
            format: LogFormat::Pretty,
            default_filter: "warn,courseforge_infra=debug".to_string(),
            test_writer: true,
        }
    }

    fn filter(&self) -> Result<EnvFilter, ObservabilityError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_filter)
                .map_err(|e| ObservabilityError::InvalidFilter(e.to_string())),
        }
    }
}

/// Install the global subscriber.
///
/// Only the first call in a process wins; later calls return
/// `AlreadyInitialized` and leave the installed subscriber alone.
pub fn init(config: &LogConfig) -> Result<(), ObservabilityError> {
    let filter = config.filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let installed = match (config.format, config.test_writer) {
        (LogFormat::Json, false) => builder.json().with_target(false).try_init(),
        (LogFormat::Json, true) => builder.json().with_target(false).with_test_writer().try_init(),
        (LogFormat::Pretty, false) => builder.with_target(true).try_init(),
        (LogFormat::Pretty, true) => builder.with_target(true).with_test_writer().try_init(),
    };
    installed.map_err(|_| ObservabilityError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_to_json_at_info() {
        let cfg = LogConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, LogConfig::default());
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.default_filter, "info");
    }

    #[test]
    fn reads_format_and_level() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("COURSEFORGE_LOG_FORMAT", "Pretty"),
            ("COURSEFORGE_LOG_LEVEL", "courseforge_infra=trace"),
        ]);
        let cfg = LogConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert_eq!(cfg.default_filter, "courseforge_infra=trace");
    }

    #[test]
    fn rejects_unknown_format() {
        let err = LogConfig::from_lookup(|k| (k == "COURSEFORGE_LOG_FORMAT").then(|| "xml".to_string()));
        assert!(matches!(err, Err(ObservabilityError::InvalidFormat(f)) if f == "xml"));
    }

    #[test]
    fn second_init_is_rejected() {
        let _ = init(&LogConfig::for_tests());
        assert!(matches!(
            init(&LogConfig::for_tests()),
            Err(ObservabilityError::AlreadyInitialized)
        ));
    }
}
