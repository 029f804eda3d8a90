use async_trait::async_trait;
use event_store::{EventStore, ExportBatch, ImportReport, StoredEvent};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::service::{ActivationRequest, ActivationResponse, OnlineSyncService};
use crate::config::SyncConfig;
use crate::error::ServiceResult;

/// Link from a local machine to the online web
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn activate(&self, request: ActivationRequest) -> ServiceResult<ActivationResponse>;

    async fn push(&self, facility_id: &str, events: Vec<StoredEvent>)
        -> ServiceResult<ImportReport>;

    async fn pull(&self, facility_id: &str, cursor: i64) -> ServiceResult<ExportBatch>;

    async fn confirm(&self, event_ids: &[Uuid]) -> ServiceResult<u64>;
}

/// Calls an [`OnlineSyncService`] living in the same process
pub struct InProcessTransport<S: EventStore> {
    service: Arc<OnlineSyncService<S>>,
}

impl<S: EventStore> InProcessTransport<S> {
    pub fn new(service: Arc<OnlineSyncService<S>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: EventStore + 'static> PeerTransport for InProcessTransport<S> {
    async fn activate(&self, request: ActivationRequest) -> ServiceResult<ActivationResponse> {
        self.service.activate(request).await
    }

    async fn push(
        &self,
        facility_id: &str,
        events: Vec<StoredEvent>,
    ) -> ServiceResult<ImportReport> {
        self.service.receive_batch(facility_id, events).await
    }

    async fn pull(&self, facility_id: &str, cursor: i64) -> ServiceResult<ExportBatch> {
        self.service.export_for(facility_id, cursor).await
    }

    async fn confirm(&self, event_ids: &[Uuid]) -> ServiceResult<u64> {
        self.service.confirm_received(event_ids).await
    }
}

/// Counts of one push/pull round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRound {
    pub pushed: usize,
    pub acknowledged: u64,
    pub pulled: usize,
    pub imported: usize,
}

/// Local machine side of the exchange
pub struct LocalSyncAgent<S: EventStore> {
    store: Arc<S>,
    transport: Arc<dyn PeerTransport>,
    config: SyncConfig,
    machine_id: Uuid,
    replay_trigger: Option<Arc<Notify>>,
}

impl<S: EventStore + 'static> LocalSyncAgent<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn PeerTransport>,
        config: SyncConfig,
        machine_id: Uuid,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            machine_id,
            replay_trigger: None,
        }
    }

    pub fn with_replay_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.replay_trigger = Some(trigger);
        self
    }

    fn facility_id(&self) -> &str {
        self.store.local_facility()
    }

    pub async fn activate(&self) -> ServiceResult<ActivationResponse> {
        self.transport
            .activate(ActivationRequest {
                facility_id: self.facility_id().to_string(),
                machine_id: self.machine_id,
            })
            .await
    }

    /// Send own unacknowledged events; mark what the web accepted
    pub async fn push(&self) -> ServiceResult<(usize, u64)> {
        let backlog = self
            .store
            .find_unacknowledged_sent_by(self.facility_id(), self.config.batch_size)
            .await?;
        if backlog.is_empty() {
            return Ok((0, 0));
        }

        let pushed = backlog.len();
        let report = self.transport.push(self.facility_id(), backlog).await?;
        for rejected in &report.rejected {
            warn!(
                event_id = %rejected.id,
                reason = %rejected.reason,
                "Online web refused event"
            );
        }

        let acknowledged = self
            .store
            .confirm_received_to_online_web(&report.received_ids())
            .await?;
        Ok((pushed, acknowledged))
    }

    /// Fetch the next page of peer events, import it, confirm receipt and
    /// advance the cursor
    pub async fn pull(&self) -> ServiceResult<(usize, usize)> {
        let peer_id = self.config.peer_id.as_str();
        let cursor = self.store.load_cursor(peer_id).await?;
        let batch = self.transport.pull(self.facility_id(), cursor).await?;
        let pulled = batch.events.len();

        let imported = if batch.events.is_empty() {
            0
        } else {
            let report = self.store.import_batch(batch.events).await?;
            for rejected in &report.rejected {
                error!(
                    event_id = %rejected.id,
                    reason = %rejected.reason,
                    "Peer event refused locally"
                );
            }
            if !report.awaiting_predecessors.is_empty() {
                warn!(
                    count = report.awaiting_predecessors.len(),
                    "Pulled group events are waiting for predecessors"
                );
            }

            let received = report.received_ids();
            if !received.is_empty() {
                self.transport.confirm(&received).await?;
            }
            if !report.imported.is_empty() {
                if let Some(trigger) = &self.replay_trigger {
                    trigger.notify_one();
                }
            }
            report.imported.len()
        };

        if batch.next_cursor > cursor {
            self.store.save_cursor(peer_id, batch.next_cursor).await?;
        }
        Ok((pulled, imported))
    }

    pub async fn sync_once(&self) -> ServiceResult<SyncRound> {
        let (pushed, acknowledged) = self.push().await?;
        let (pulled, imported) = self.pull().await?;

        let round = SyncRound {
            pushed,
            acknowledged,
            pulled,
            imported,
        };
        if round != SyncRound::default() {
            info!(
                pushed,
                acknowledged,
                pulled,
                imported,
                "Sync round finished"
            );
        } else {
            debug!("Nothing to sync");
        }
        Ok(round)
    }

    /// Activate (retrying every interval until it succeeds), then sync
    /// every interval
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(
            facility_id = %self.facility_id(),
            peer_id = %self.config.peer_id,
            interval_secs = self.config.interval.as_secs(),
            "Sync agent starting"
        );

        let activation = loop {
            match self.activate().await {
                Ok(activation) => break activation,
                Err(e) => {
                    warn!(error = %e, "Activation with online web failed, retrying");
                    tokio::time::sleep(self.config.interval).await;
                }
            }
        };
        info!(
            activated_at = %activation.peer.activated_at,
            newly_activated = activation.newly_activated,
            "Local machine registered with online web"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.sync_once().await {
                error!(error = %e, "Sync round failed");
            }
        }
    }
}
