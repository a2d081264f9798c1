//! Error types for the sync layer

use pei_proto::EntityType;
use thiserror::Error;

/// Result type used by the library
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by local operations of the sync layer.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{entity_type} record not found: {id}")]
    NotFound { entity_type: EntityType, id: String },

    #[error("{entity_type} record already exists: {id}")]
    AlreadyExists { entity_type: EntityType, id: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("No connectivity to the remote backend")]
    Offline,

    #[error("Sync layer is shutting down")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a remote collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection refused, timeout, 5xx.
    #[error("Network error: {0}")]
    Network(String),

    /// Validation or permission failure. Never retried automatically.
    #[error("Rejected by remote ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Not found on remote")]
    NotFound,

    #[error("Malformed remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether the failure is retried on a later cycle (bounded by `max_retries`).
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Decode(_))
    }
}
