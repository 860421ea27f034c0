//! Error hierarchy for Parlor.

use thiserror::Error;

/// Top-level error type for Parlor operations.
#[derive(Debug, Error)]
pub enum ParlorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Compaction error: {0}")]
    Compaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
