//! Scheduler service configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{env_seconds, env_u64, ConfigResult};

/// Tunables for the scheduler control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch-cycle cadence; the base tick of the control loop.
    pub poll_interval: Duration,
    /// Window during which a dispatched job will not be dispatched again.
    pub dispatch_lock_duration: Duration,
    /// Age at which an IN_PROGRESS dispatch is considered dead.
    pub timeout_threshold: Duration,
    /// Retry budget per job failure.
    pub max_retry_attempts: i32,
    /// How long terminal dispatch rows are retained.
    pub cleanup_retention: Duration,
    /// Heartbeat age past which a worker registration is reaped.
    pub worker_offline_threshold: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            poll_interval: env_seconds("SCHEDULER_POLL_INTERVAL", 10)?,
            dispatch_lock_duration: env_seconds("DISPATCH_LOCK_DURATION", 300)?,
            timeout_threshold: env_seconds("JOB_TIMEOUT_THRESHOLD", 600)?,
            max_retry_attempts: env_u64("MAX_RETRY_ATTEMPTS", 3)?.min(i32::MAX as u64) as i32,
            cleanup_retention: Duration::from_secs(
                env_u64("CLEANUP_RETENTION_DAYS", 30)? * 86_400,
            ),
            worker_offline_threshold: env_seconds("WORKER_OFFLINE_THRESHOLD", 180)?,
        })
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            dispatch_lock_duration: Duration::from_secs(300),
            timeout_threshold: Duration::from_secs(600),
            max_retry_attempts: 3,
            cleanup_retention: Duration::from_secs(30 * 86_400),
            worker_offline_threshold: Duration::from_secs(180),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.dispatch_lock_duration, Duration::from_secs(300));
        assert_eq!(config.timeout_threshold, Duration::from_secs(600));
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.worker_offline_threshold, Duration::from_secs(180));
    }
}
