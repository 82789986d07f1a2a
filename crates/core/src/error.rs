// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue is full (max_size={0})")]
    QueueFull(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] crate::port::DeliveryError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] crate::port::ConvertError),

    #[error("Critical error: {0}")]
    Critical(#[from] CriticalError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for errors that leave an operation's state unknown.
    pub fn is_critical(&self) -> bool {
        matches!(self, AppError::Critical(_))
    }
}

/// Failures that no automatic remedy can act on.
///
/// These propagate to the supervisory layer for operator attention.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CriticalError {
    /// The live action failed and recording that failure failed too.
    #[error(
        "operation {operation_id} ({operation_type}) failed and its failure could not be \
         persisted: primary error: {primary_error}; fallback error: {fallback_error}"
    )]
    DoubleFailure {
        operation_id: String,
        operation_type: String,
        primary_error: String,
        fallback_error: String,
    },
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// Lock poisoning only happens after a panic while holding the lock
impl<T> From<std::sync::PoisonError<T>> for AppError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AppError::Internal(format!("lock poisoned: {}", err))
    }
}
