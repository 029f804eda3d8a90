//! Application of stored events to local state.
//!
//! One [`Replayer`] per event category. The [`ReplayDispatcher`] owns the
//! ordering rules: one group at a time per group id, ascending sequence,
//! never past a gap or a failure.

mod dispatcher;
pub mod replayers;
mod worker;

pub use dispatcher::{GroupReplay, ReplayDispatcher, ReplaySummary};
pub use worker::ReplayWorker;

use async_trait::async_trait;
use event_store::{EventStoreError, StoredEvent};
use thiserror::Error;
use uuid::Uuid;

use crate::events::{DomainEvent, EventCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The effect was applied now
    Applied,
    /// Local state already reflected the event
    AlreadyApplied,
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Replay of event {event_id} (group {group_id:?}, entity {entity_key}) failed: {source}")]
    Failed {
        event_id: Uuid,
        group_id: Option<String>,
        entity_key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Event {event_id} has an undecodable payload: {reason}")]
    Decode { event_id: Uuid, reason: String },

    #[error("No replayer registered for category {0}")]
    NoReplayer(EventCategory),

    #[error("Event store error: {0}")]
    Store(#[from] EventStoreError),
}

/// Applies events of one category, idempotently
#[async_trait]
pub trait Replayer: Send + Sync {
    fn category(&self) -> EventCategory;

    /// Look up current state, skip if the effect is present, apply otherwise
    async fn replay(&self, stored: &StoredEvent, event: &DomainEvent)
        -> anyhow::Result<ReplayOutcome>;
}
