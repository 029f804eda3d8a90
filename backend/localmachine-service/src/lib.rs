//! Localmachine sync engine.
//!
//! Captures domain changes on a facility (PostgreSQL logical decoding and
//! explicit emits), records them in the [`event_store`] log as ordered
//! per-entity groups, exchanges them with the online web and replays them
//! exactly once on the receiving side.
//!
//! - [`cdc`]: capture, record model, listener dispatch, resume offsets
//! - [`emitters`], [`publisher`]: turning changes into log events
//! - [`replay`]: ordered, idempotent application through [`services`]
//! - [`heartbeat`]: liveness of the capture stream and recovery
//! - [`sync`]: activation, push/pull exchange, master data snapshots

pub mod auth;
pub mod cdc;
pub mod clock;
pub mod config;
pub mod emitters;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod publisher;
pub mod replay;
pub mod services;
pub mod sync;

pub use config::{Config, NodeRole};
pub use error::{ServiceError, ServiceResult};
pub use events::{DomainEvent, EventCategory};
pub use publisher::EventPublisher;
