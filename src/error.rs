//! Error types for the sync engine

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync engine error types
///
/// Mutation failures are always resolved locally (rolled back) before one of
/// these reaches the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Consuming mutation against an exhausted supply (rejected before dispatch)
    #[error("Insufficient supply for {entity_id}: {available} left")]
    InsufficientSupply { entity_id: String, available: u32 },

    /// Ledger cannot cover the cost (rejected before dispatch)
    #[error("Insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: i64, available: i64 },

    /// Network error talking to the backend
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call exceeded the mutation timeout
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// Server rejected the write
    #[error("Server validation failed: {0}")]
    Validation(String),

    /// Local store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Entity not found in cache or backend
    #[error("Not found: {0}")]
    NotFound(String),

    /// Intent does not apply to this entity kind
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No signed-in scope
    #[error("No active scope, sign in first")]
    NoScope,
}

impl SyncError {
    /// Locally detectable invariant violations. No cache mutation happened.
    pub fn is_rejected_before_dispatch(&self) -> bool {
        matches!(
            self,
            SyncError::InsufficientSupply { .. }
                | SyncError::InsufficientBalance { .. }
                | SyncError::InvalidMutation(_)
        )
    }

    /// Failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Storage(format!("store task failed: {}", err))
    }
}
