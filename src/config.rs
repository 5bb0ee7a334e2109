//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Application name, used to namespace loggers.
    pub name: String,
    /// Number of execution workers. Fixed for the lifetime of the pool.
    pub workers: usize,
    /// How often conditional jobs re-evaluate their predicate.
    pub condition_poll_interval: Duration,
    /// Per-execution deadline. `None` lets a job run indefinitely.
    pub execution_timeout: Option<Duration>,
    /// How long `stop()` waits for job drivers to wind down before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "offchain".to_string(),
            workers: 4,
            condition_poll_interval: Duration::from_millis(50),
            execution_timeout: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    /// Build from `OFFCHAIN_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` delegates here.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("OFFCHAIN_APP_NAME").filter(|n| !n.trim().is_empty()) {
            config.name = name.trim().to_string();
        }

        if let Some(workers) = parse_u64(&lookup, "OFFCHAIN_WORKERS")? {
            if workers == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "OFFCHAIN_WORKERS".to_string(),
                    message: "worker count must be at least 1".to_string(),
                });
            }
            config.workers = workers as usize;
        }

        if let Some(ms) = parse_u64(&lookup, "OFFCHAIN_CONDITION_POLL_MS")? {
            config.condition_poll_interval = Duration::from_millis(ms.max(1));
        }

        // 0 disables the deadline
        if let Some(ms) = parse_u64(&lookup, "OFFCHAIN_EXECUTION_TIMEOUT_MS")? {
            config.execution_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(ms) = parse_u64(&lookup, "OFFCHAIN_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?} is not a non-negative integer: {e}"),
            }),
    }
}
