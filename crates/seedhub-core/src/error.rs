//! Error types for Seedhub core

use thiserror::Error;

/// Errors that can occur in Seedhub core
#[derive(Debug, Error)]
pub enum SeedhubError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SeedhubError {
    /// Connection-level failures trigger reconnect scheduling on the
    /// owning instance instead of propagating to the caller.
    pub fn is_connection(&self) -> bool {
        matches!(self, SeedhubError::Connection { .. })
    }

    pub fn connection(message: impl Into<String>) -> Self {
        SeedhubError::Connection {
            message: message.into(),
        }
    }
}
