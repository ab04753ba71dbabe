//! Typed configuration for the orchestration core.
//!
//! Every component receives its configuration as a constructor input;
//! [`CoreConfig::from_env`] is the only place that reads the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

/// Retry/backoff policy: exponential, doubling from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (claims) before a failure becomes final.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(750),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts` claims.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Recognized configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub max_attempts: u32,
    pub retry_delay_base: Duration,
    pub retry_delay_cap: Duration,
    /// A running job whose heartbeat is older than this may be reclaimed.
    pub stale_lease: Duration,
    pub worker_count: usize,
    pub lease_heartbeat_period: Duration,
    pub compensation_on_fatal: bool,
    /// Sleep between empty claim attempts.
    pub poll_interval: Duration,
    /// Upper bound on a single claim round-trip.
    pub claim_timeout: Duration,
    /// How long an orchestrated root waits before re-checking a delegated child job.
    pub orchestrator_poll_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let stale_lease = Duration::from_secs(120);
        Self {
            max_attempts: 5,
            retry_delay_base: Duration::from_millis(750),
            retry_delay_cap: Duration::from_secs(10),
            stale_lease,
            worker_count: 1,
            lease_heartbeat_period: stale_lease / 4,
            compensation_on_fatal: true,
            poll_interval: Duration::from_millis(250),
            claim_timeout: Duration::from_secs(5),
            orchestrator_poll_interval: Duration::from_secs(2),
        }
    }
}

impl CoreConfig {
    /// Load configuration from `COURSEFORGE_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values are logged and ignored.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CoreConfig::from_env`], reading through `lookup` instead of the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse_var::<u32>(&lookup, "COURSEFORGE_MAX_ATTEMPTS") {
            cfg.max_attempts = v;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COURSEFORGE_RETRY_DELAY_BASE_MS") {
            cfg.retry_delay_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COURSEFORGE_RETRY_DELAY_CAP_MS") {
            cfg.retry_delay_cap = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "COURSEFORGE_STALE_LEASE_SECS") {
            cfg.stale_lease = Duration::from_secs(secs);
            cfg.lease_heartbeat_period = cfg.stale_lease / 4;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "COURSEFORGE_WORKER_COUNT") {
            cfg.worker_count = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COURSEFORGE_HEARTBEAT_PERIOD_MS") {
            cfg.lease_heartbeat_period = Duration::from_millis(ms);
        }
        if let Some(b) = parse_var::<bool>(&lookup, "COURSEFORGE_COMPENSATION_ON_FATAL") {
            cfg.compensation_on_fatal = b;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COURSEFORGE_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COURSEFORGE_CLAIM_TIMEOUT_MS") {
            cfg.claim_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COURSEFORGE_ORCHESTRATOR_POLL_MS") {
            cfg.orchestrator_poll_interval = Duration::from_millis(ms);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_count == 0 {
            return Err(CoreError::config("worker_count must be >= 1"));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::config("max_attempts must be >= 1"));
        }
        if self.retry_delay_base > self.retry_delay_cap {
            return Err(CoreError::config(
                "retry_delay_base must not exceed retry_delay_cap",
            ));
        }
        if self.stale_lease.is_zero() {
            return Err(CoreError::config("stale_lease must be > 0"));
        }
        if self.lease_heartbeat_period.is_zero() || self.lease_heartbeat_period >= self.stale_lease
        {
            return Err(CoreError::config(
                "lease_heartbeat_period must be > 0 and < stale_lease",
            ));
        }
        Ok(())
    }

    /// The default retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_delay_base,
            max_delay: self.retry_delay_cap,
        }
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the stale lease; the heartbeat period follows at a quarter of it.
    pub fn with_stale_lease(mut self, stale_lease: Duration) -> Self {
        self.stale_lease = stale_lease;
        self.lease_heartbeat_period = stale_lease / 4;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_compensation_on_fatal(mut self, enabled: bool) -> Self {
        self.compensation_on_fatal = enabled;
        self
    }

    pub fn with_orchestrator_poll_interval(mut self, interval: Duration) -> Self {
        self.orchestrator_poll_interval = interval;
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}
