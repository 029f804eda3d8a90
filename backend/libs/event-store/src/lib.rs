//! # Sync Event Log
//!
//! Durable, append-only log of domain events exchanged between a local machine
//! and its online web counterpart.
//!
//! ## Ordering
//!
//! Events carrying a `group_id` form a causal stream. The store assigns each
//! one the next sequence of its group under a per-group serialization point
//! (a row lock on `event_group_sequences` in PostgreSQL, the store mutex in
//! memory), so two events of the same group never share a sequence and the
//! one appended first always gets the smaller number. Events without a group
//! are ordered by arrival only.
//!
//! ## Replay bookkeeping
//!
//! Every stored event carries a `replayed` flag meaning "no replay is
//! outstanding on this node". It starts `false` only for events this node has
//! to apply (see [`needs_replay_on`]). [`EventStore::last_replayed_sequence`]
//! is the length of the contiguous, fully replayed prefix of a group: replay of
//! sequence N+1 may only start once it equals N.
//!
//! ## Peer exchange
//!
//! [`EventStore::import_batch`] deduplicates by event id, refuses a second
//! event claiming an occupied group sequence, and reports group events whose
//! predecessors are still missing. Those stay stored but unreplayable until
//! the gap fills. Locally emitted events remain in the push backlog until
//! [`EventStore::confirm_received_to_online_web`] marks them acknowledged.

use async_trait::async_trait;
use uuid::Uuid;

mod error;
mod memory;
pub mod metrics;
mod model;
mod postgres;

pub use error::{EventStoreError, EventStoreResult};
pub use memory::InMemoryEventStore;
pub use model::{
    needs_replay_on, ExportBatch, ImportReport, NewEvent, RejectedEvent, StoredEvent,
};
pub use postgres::PostgresEventStore;

/// Event log interface
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Facility id of the node owning this log
    fn local_facility(&self) -> &str;

    /// Append a locally emitted event, assigning its group sequence.
    async fn append(&self, event: NewEvent) -> EventStoreResult<StoredEvent>;

    /// Import events received from a peer.
    async fn import_batch(&self, events: Vec<StoredEvent>) -> EventStoreResult<ImportReport>;

    async fn find_by_id(&self, event_id: Uuid) -> EventStoreResult<Option<StoredEvent>>;

    /// Every stored event of a group, ascending sequence.
    async fn find_by_group(&self, group_id: &str) -> EventStoreResult<Vec<StoredEvent>>;

    /// Not yet replayed events of a group, ascending sequence.
    async fn find_unreplayed_by_group_ordered(
        &self,
        group_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>>;

    /// Highest sequence N such that sequences 1..=N of the group are all
    /// present and replayed; 0 when nothing is.
    async fn last_replayed_sequence(&self, group_id: &str) -> EventStoreResult<i64>;

    /// Events awaiting local replay, arrival order.
    async fn find_replay_candidates(&self, limit: i64) -> EventStoreResult<Vec<StoredEvent>>;

    async fn mark_replayed(&self, event_id: Uuid) -> EventStoreResult<()>;

    /// Unacknowledged events destined to a peer.
    async fn find_pending_for_receiver(
        &self,
        receiver_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>>;

    /// Unacknowledged events emitted by `sender_id`, arrival order.
    async fn find_unacknowledged_sent_by(
        &self,
        sender_id: &str,
        limit: i64,
    ) -> EventStoreResult<Vec<StoredEvent>>;

    /// Mark events as received by the peer. Returns the number of rows changed.
    async fn confirm_received_to_online_web(&self, event_ids: &[Uuid]) -> EventStoreResult<u64>;

    /// Events with a local position greater than `cursor`, ascending.
    async fn export_since(&self, cursor: i64, limit: i64) -> EventStoreResult<ExportBatch>;

    /// Number of events of `category` stored after `after_position`.
    async fn count_since(&self, category: &str, after_position: i64) -> EventStoreResult<i64>;

    /// Newest event of `category` whose payload carries every top-level
    /// field of `filter` with the same value.
    async fn find_latest_matching(
        &self,
        category: &str,
        filter: &serde_json::Value,
    ) -> EventStoreResult<Option<StoredEvent>>;

    /// Highest local position, 0 for an empty log.
    async fn latest_position(&self) -> EventStoreResult<i64>;

    async fn load_cursor(&self, peer_id: &str) -> EventStoreResult<i64>;

    async fn save_cursor(&self, peer_id: &str, position: i64) -> EventStoreResult<()>;

    /// `(pending replay, unacknowledged local)` counts for monitoring.
    async fn pending_stats(&self) -> EventStoreResult<(i64, i64)>;
}
