//! Worker service configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{env_seconds, env_u64, ConfigError, ConfigResult};

/// Tunables for the worker claim/execute loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base polling cadence when the queue is empty.
    pub poll_interval: Duration,
    /// Cap for the exponential poll backoff.
    pub max_poll_interval: Duration,
    /// Liveness update cadence.
    pub heartbeat_interval: Duration,
    /// Wall-clock limit for a single script execution.
    pub job_timeout: Duration,
    /// Allow-listed directory all scripts must live under.
    pub script_root: PathBuf,
    /// How long an in-flight script may run after a shutdown signal before
    /// its dispatch is released anyway.
    pub shutdown_grace: Duration,
    /// Cap on captured stdout+stderr, in bytes.
    pub output_cap: usize,
}

impl WorkerConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let config = Self {
            poll_interval: env_seconds("WORKER_POLL_INTERVAL", 5)?,
            max_poll_interval: env_seconds("WORKER_MAX_POLL_INTERVAL", 60)?,
            heartbeat_interval: env_seconds("WORKER_HEARTBEAT_INTERVAL", 30)?,
            job_timeout: env_seconds("WORKER_JOB_TIMEOUT", 600)?,
            script_root: PathBuf::from(
                std::env::var("WORKER_SCRIPT_ROOT").unwrap_or_else(|_| "./scripts".to_string()),
            ),
            shutdown_grace: env_seconds("WORKER_SHUTDOWN_GRACE", 30)?,
            output_cap: env_u64("WORKER_OUTPUT_CAP", 1024 * 1024)? as usize,
        };
        config.validate()?;
        Ok(config)
    }

    /// Refuse to start with a sandbox root that does not exist; a worker with
    /// nowhere to resolve scripts would fail every dispatch it claims.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.script_root.is_dir() {
            return Err(ConfigError::BadScriptRoot(self.script_root.clone()));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600),
            script_root: PathBuf::from("./scripts"),
            shutdown_grace: Duration::from_secs(30),
            output_cap: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_poll_interval, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.job_timeout, Duration::from_secs(600));
        assert_eq!(config.output_cap, 1024 * 1024);
    }

    #[test]
    fn missing_script_root_fails_validation() {
        let config = WorkerConfig {
            script_root: PathBuf::from("/nonexistent/taskmill-scripts"),
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
