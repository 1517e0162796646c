use thiserror::Error;
use uuid::Uuid;

use crate::retry::ErrorClass;

/// Application-wide error types for Wavecast.
#[derive(Error, Debug)]
pub enum AppError {
    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// An active (queued, retrying or running) job already owns the key.
    #[error("An active {stage} job already exists for item {item_id}")]
    DuplicateActiveJob { item_id: Uuid, stage: String },

    /// Wave target time is not in the future.
    #[error("Invalid wave target: {0}")]
    InvalidTarget(String),

    /// The wave's target time has passed; no more members may be added.
    #[error("Wave {0} is closed: target time has passed")]
    WaveClosed(Uuid),

    /// Request failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested state change is not allowed from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// HTTP request to an external service failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        AppError::NotFound { kind, id }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::DatabaseError(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Classification used when an infrastructure error surfaces as a stage failure.
    pub fn error_class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}
