//! Configuration error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{key} must be positive")]
    NotPositive { key: &'static str },

    #[error("script root {0:?} does not exist or is not a directory")]
    BadScriptRoot(std::path::PathBuf),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
