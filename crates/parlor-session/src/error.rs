//! Session-specific error types.

use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {key}")]
    NotFound { key: String },

    #[error("Invalid session name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl SessionError {
    pub(crate) fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }
}

impl From<SessionError> for parlor_types::ParlorError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Io(e) => Self::Io(e),
            other => Self::Session(other.to_string()),
        }
    }
}
