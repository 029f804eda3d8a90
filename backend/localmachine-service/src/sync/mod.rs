//! Event exchange between local machines and the online web.
//!
//! The web runs an [`OnlineSyncService`]; each local machine runs a
//! [`LocalSyncAgent`] that pushes its own unacknowledged events and pulls
//! whatever the web routes to it. Delivery is at-least-once on both legs:
//! events stay in the sender's backlog until the other side confirms them,
//! and imports deduplicate by event id.

mod agent;
mod peers;
mod service;
mod snapshot;

pub use agent::{InProcessTransport, LocalSyncAgent, PeerTransport, SyncRound};
pub use peers::{InMemoryPeerRegistry, LocalMachinePeer, PeerRegistry, PgPeerRegistry, Registration};
pub use service::{ActivationRequest, ActivationResponse, OnlineSyncService};
pub use snapshot::{PgMasterDataSource, SnapshotScheduler};
