use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event about to be appended to the log.
///
/// The sequence and local position are assigned by the store; everything
/// else is fixed by the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Unique identifier; travels unchanged to every peer
    pub id: Uuid,
    /// Causal ordering domain (e.g. a requisition number); `None` for independent events
    pub group_id: Option<String>,
    /// Facility that emitted the event
    pub sender_id: String,
    /// Facility the event must be replayed on, if any
    pub receiver_id: Option<String>,
    /// Stable category tag (e.g. `RELEASED_WITHOUT_ORDER`)
    pub category: String,
    /// Category specific payload
    pub payload: serde_json::Value,
    /// When the triggering change happened
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        sender_id: impl Into<String>,
        category: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: None,
            sender_id: sender_id.into(),
            receiver_id: None,
            category: category.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Replace the random id, for events whose identity is derived from
    /// their source
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_receiver(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = Some(receiver_id.into());
        self
    }
}

/// An event as persisted in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,
    /// Local arrival order; never exported as meaningful to a peer
    pub position: i64,
    pub group_id: Option<String>,
    /// Per-group sequence for group events, origin arrival position otherwise
    pub sequence: i64,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub category: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    /// No replay is outstanding for this event on the local node
    pub replayed: bool,
    /// A peer confirmed receipt
    pub acknowledged: bool,
}

impl StoredEvent {
    pub fn is_group_event(&self) -> bool {
        self.group_id.is_some()
    }
}

/// Whether an event with the given routing has to be replayed on `local_facility`.
///
/// Directed events are replayed by their receiver. Undirected events are
/// replayed by every node except the one that produced them, whose state
/// already reflects the change.
pub fn needs_replay_on(sender_id: &str, receiver_id: Option<&str>, local_facility: &str) -> bool {
    match receiver_id {
        Some(receiver) => receiver == local_facility,
        None => sender_id != local_facility,
    }
}

/// A page of the log read after a cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportBatch {
    pub events: Vec<StoredEvent>,
    /// Position to resume from on the next call
    pub next_cursor: i64,
}

impl ExportBatch {
    /// Keep only the events a given peer should receive. The cursor still
    /// covers the dropped events so the next page does not revisit them.
    pub fn retain_for(mut self, peer_id: &str) -> Self {
        self.events.retain(|event| {
            event.sender_id != peer_id
                && event
                    .receiver_id
                    .as_deref()
                    .map_or(true, |receiver| receiver == peer_id)
        });
        self
    }
}

/// A peer event that could not be imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEvent {
    pub id: Uuid,
    pub reason: String,
}

/// Outcome of [`crate::EventStore::import_batch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Newly stored events
    pub imported: Vec<Uuid>,
    /// Events already present; not stored again
    pub duplicates: Vec<Uuid>,
    /// Stored group events whose predecessors have not arrived yet
    pub awaiting_predecessors: Vec<Uuid>,
    /// Events refused (e.g. a different event already owns the group sequence)
    pub rejected: Vec<RejectedEvent>,
}

impl ImportReport {
    /// Ids the sender may consider delivered
    pub fn received_ids(&self) -> Vec<Uuid> {
        self.imported
            .iter()
            .chain(self.duplicates.iter())
            .copied()
            .collect()
    }
}
