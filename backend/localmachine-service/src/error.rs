/// Error types for localmachine-service
use event_store::EventStoreError;
use thiserror::Error;
use uuid::Uuid;

use crate::replay::ReplayError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CDC record for table {table} has {values} values for {columns} columns")]
    MalformedRecord {
        table: String,
        columns: usize,
        values: usize,
    },

    #[error("CDC batch at position {failed} must be handled before position {requested}")]
    CdcBatchPending { failed: i64, requested: i64 },

    #[error("Facility {0} has not been activated")]
    NotActivated(String),

    #[error("Unknown event category: {0}")]
    UnknownCategory(String),

    #[error("Event {event_id} rejected by peer: {reason}")]
    Rejected { event_id: Uuid, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Whether retrying the whole unit of work can succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::EventStore(e) if e.is_conflict())
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
