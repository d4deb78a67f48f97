//! Unified error types for Baton

use thiserror::Error;

/// Unified error type for all Baton operations
#[derive(Error, Debug)]
pub enum BatonError {
    // Validation errors (never retried)
    #[error("Worker not found: {0}")]
    UnknownWorker(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Voting session not found: {0}")]
    UnknownSession(String),

    #[error("Voting session {0} is already closed")]
    SessionClosed(String),

    #[error("Conflict not found: {0}")]
    UnknownConflict(String),

    #[error("Conflict {0} is already resolved")]
    ConflictAlreadyResolved(String),

    #[error("Handoff not found or already completed: {0}")]
    UnknownHandoff(String),

    #[error("No preserved context for handoff: {0}")]
    NoPreservedContext(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Capacity errors
    #[error("No workers registered")]
    NoWorkersRegistered,

    // Execution errors
    #[error("{operation} failed after {attempts} attempts: {last_error:#}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last_error: anyhow::Error,
    },

    #[error("Primary and fallback both failed for {category}: primary: {primary:#}; fallback: {fallback:#}")]
    FallbackExhausted {
        category: String,
        primary: anyhow::Error,
        #[source]
        fallback: anyhow::Error,
    },

    #[error("Execution failed: {0}")]
    Execution(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl BatonError {
    /// Validation errors describe bad input and must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownWorker(_)
                | Self::DuplicateWorker(_)
                | Self::UnknownSession(_)
                | Self::SessionClosed(_)
                | Self::UnknownConflict(_)
                | Self::ConflictAlreadyResolved(_)
                | Self::UnknownHandoff(_)
                | Self::NoPreservedContext(_)
                | Self::Validation(_)
        )
    }

    /// Number of attempts made before a terminal execution failure, if known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Result type alias using BatonError
pub type Result<T> = std::result::Result<T, BatonError>;
