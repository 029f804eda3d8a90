//! Error types for the event store library.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for event store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// PostgreSQL SQLSTATE codes that mean "another transaction won the race".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

const EVENTS_PKEY: &str = "events_pkey";
const GROUP_SEQUENCE_KEY: &str = "events_group_sequence_key";

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Per-group sequence assignment lost a race; retry the whole transaction
    #[error("Concurrent append conflict on group {group_id}")]
    ConcurrentAppendConflict { group_id: String },

    /// An event with this id is already in the log. `append` turns this into
    /// a success carrying the stored event; it only surfaces from
    /// `append_in_tx`, whose transaction is aborted by then.
    #[error("Event {0} is already in the log")]
    DuplicateEvent(Uuid),

    /// Event not found in the log
    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    /// A different event already holds this group sequence
    #[error("Sequence {sequence} of group {group_id} already taken by event {existing}")]
    SequenceCollision {
        group_id: String,
        sequence: i64,
        existing: Uuid,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Event store error: {0}")]
    Other(#[from] anyhow::Error),
}

impl EventStoreError {
    /// Whether retrying the surrounding transaction can succeed.
    pub fn is_conflict(&self) -> bool {
        match self {
            EventStoreError::ConcurrentAppendConflict { .. } => true,
            EventStoreError::Database(sqlx_err) => matches!(
                sqlstate(sqlx_err).as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ),
            _ => false,
        }
    }

    /// Map a failure of the sequence-assignment + insert step. Lock races and
    /// a lost `(group_id, sequence)` uniqueness check become conflicts; a
    /// taken event id is a duplicate.
    pub(crate) fn from_append(err: sqlx::Error, event_id: Uuid, group_id: Option<&str>) -> Self {
        let code = sqlstate(&err);
        let constraint = err
            .as_database_error()
            .and_then(|db_err| db_err.constraint())
            .map(str::to_string);

        match (code.as_deref(), constraint.as_deref()) {
            (Some(UNIQUE_VIOLATION), Some(EVENTS_PKEY)) => {
                EventStoreError::DuplicateEvent(event_id)
            }
            (Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED), _)
            | (Some(UNIQUE_VIOLATION), Some(GROUP_SEQUENCE_KEY)) => match group_id {
                Some(group_id) => EventStoreError::ConcurrentAppendConflict {
                    group_id: group_id.to_string(),
                },
                None => EventStoreError::Database(err),
            },
            _ => EventStoreError::Database(err),
        }
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .map(|code| code.into_owned())
}
