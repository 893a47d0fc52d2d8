//! Error types for Taskmill core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid time of day: {0}")]
    InvalidTime(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid script path: {0}")]
    InvalidScriptPath(String),
}

pub type Result<T> = std::result::Result<T, Error>;
