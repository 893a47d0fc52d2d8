//! Status enums for dispatches, workers and execution logs.
//!
//! All of these are stored as TEXT columns; the `sqlx::Type` derives map the
//! variants to the uppercase wire strings (`PENDING`, `IN_PROGRESS`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Lifecycle state of a dispatch record.
///
/// `Pending -> InProgress -> {Completed | Failed | Timeout}`. A terminal row
/// never re-enters the pipeline; retries are fresh `Pending` rows with an
/// incremented retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Completed | DispatchStatus::Failed | DispatchStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "PENDING",
            DispatchStatus::InProgress => "IN_PROGRESS",
            DispatchStatus::Completed => "COMPLETED",
            DispatchStatus::Failed => "FAILED",
            DispatchStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DispatchStatus::Pending),
            "IN_PROGRESS" => Ok(DispatchStatus::InProgress),
            "COMPLETED" => Ok(DispatchStatus::Completed),
            "FAILED" => Ok(DispatchStatus::Failed),
            "TIMEOUT" => Ok(DispatchStatus::Timeout),
            other => Err(Error::InvalidSchedule(format!(
                "unknown dispatch status: {other}"
            ))),
        }
    }
}

/// Liveness state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded in the execution log for one terminal dispatch.
///
/// `Failure` is a nonzero exit code; `Error` means the script never ran
/// (missing file, path escape, spawn failure); `Timeout` covers both the
/// worker's wall-clock kill and the scheduler's stuck-dispatch sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Error,
    Timeout,
}

impl ExecutionStatus {
    /// The terminal dispatch status a worker records for this outcome.
    ///
    /// `DispatchStatus::Timeout` is reserved for the scheduler's sweep; a
    /// worker that observes its own wall-clock timeout reports `Failed`.
    pub fn dispatch_status(&self) -> DispatchStatus {
        match self {
            ExecutionStatus::Success => DispatchStatus::Completed,
            _ => DispatchStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failure => "FAILURE",
            ExecutionStatus::Error => "ERROR",
            ExecutionStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!DispatchStatus::Pending.is_terminal());
        assert!(!DispatchStatus::InProgress.is_terminal());
        assert!(DispatchStatus::Completed.is_terminal());
        assert!(DispatchStatus::Failed.is_terminal());
        assert!(DispatchStatus::Timeout.is_terminal());
    }

    #[test]
    fn dispatch_status_round_trip() {
        for status in [
            DispatchStatus::Pending,
            DispatchStatus::InProgress,
            DispatchStatus::Completed,
            DispatchStatus::Failed,
            DispatchStatus::Timeout,
        ] {
            assert_eq!(status.as_str().parse::<DispatchStatus>().unwrap(), status);
        }
    }

    #[test]
    fn execution_outcome_maps_to_dispatch_status() {
        assert_eq!(
            ExecutionStatus::Success.dispatch_status(),
            DispatchStatus::Completed
        );
        assert_eq!(
            ExecutionStatus::Failure.dispatch_status(),
            DispatchStatus::Failed
        );
        assert_eq!(
            ExecutionStatus::Error.dispatch_status(),
            DispatchStatus::Failed
        );
        assert_eq!(
            ExecutionStatus::Timeout.dispatch_status(),
            DispatchStatus::Failed
        );
    }
}
