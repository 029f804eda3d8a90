use chrono::{DateTime, Utc};
use event_store::metrics::EventLogMetrics;
use event_store::{EventStore, ExportBatch, ImportReport, RejectedEvent, StoredEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::peers::{LocalMachinePeer, PeerRegistry};
use crate::clock::Clock;
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub facility_id: String,
    pub machine_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationResponse {
    pub peer: LocalMachinePeer,
    /// `false` when the facility had been activated before
    pub newly_activated: bool,
}

/// Online web side of the exchange with local machines
pub struct OnlineSyncService<S: EventStore> {
    store: Arc<S>,
    peers: Arc<dyn PeerRegistry>,
    clock: Arc<dyn Clock>,
    export_limit: i64,
    replay_trigger: Option<Arc<Notify>>,
    metrics: Option<EventLogMetrics>,
}

impl<S: EventStore> OnlineSyncService<S> {
    pub fn new(
        store: Arc<S>,
        peers: Arc<dyn PeerRegistry>,
        clock: Arc<dyn Clock>,
        export_limit: i64,
    ) -> Self {
        Self {
            store,
            peers,
            clock,
            export_limit,
            replay_trigger: None,
            metrics: None,
        }
    }

    /// Wake the replay worker after every accepted batch
    pub fn with_replay_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.replay_trigger = Some(trigger);
        self
    }

    pub fn with_metrics(mut self, metrics: EventLogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Register a local machine. Activating the same facility again returns
    /// the existing registration.
    pub async fn activate(&self, request: ActivationRequest) -> ServiceResult<ActivationResponse> {
        if request.facility_id.trim().is_empty() {
            return Err(ServiceError::Config("facility id must not be empty".to_string()));
        }
        if request.facility_id == self.store.local_facility() {
            return Err(ServiceError::Config(format!(
                "facility {} is the online web itself",
                request.facility_id
            )));
        }

        let registration = self
            .peers
            .register(&request.facility_id, request.machine_id, self.clock.now())
            .await?;

        if registration.created {
            info!(
                facility_id = %request.facility_id,
                machine_id = %request.machine_id,
                "Local machine activated"
            );
        } else {
            debug!(
                facility_id = %request.facility_id,
                machine_id = %request.machine_id,
                activated_at = %registration.peer.activated_at,
                "Local machine already activated"
            );
        }

        Ok(ActivationResponse {
            peer: registration.peer,
            newly_activated: registration.created,
        })
    }

    async fn require_active(&self, facility_id: &str) -> ServiceResult<()> {
        match self.peers.find(facility_id).await? {
            Some(_) => {
                self.peers.touch(facility_id, self.clock.now()).await?;
                Ok(())
            }
            None => Err(ServiceError::NotActivated(facility_id.to_string())),
        }
    }

    /// Stream everything `facility_id` should hold, from the start of the
    /// log, as newline-delimited JSON. Returns the number of events written.
    pub async fn re_sync_data<W>(&self, facility_id: &str, sink: &mut W) -> ServiceResult<usize>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.require_active(facility_id).await?;

        let mut cursor = 0;
        let mut written = 0;
        let mut sent = HashSet::new();
        loop {
            let batch = self.collect_for(facility_id, cursor).await?;
            for event in &batch.events {
                if !sent.insert(event.id) {
                    continue;
                }
                let mut line = serde_json::to_vec(event)?;
                line.push(b'\n');
                sink.write_all(&line).await?;
                written += 1;
            }
            if batch.next_cursor == cursor {
                break;
            }
            cursor = batch.next_cursor;
        }
        sink.flush().await?;

        info!(facility_id = %facility_id, events = written, "Re-sync export finished");
        Ok(written)
    }

    /// Mark events as delivered to the peer that pulled them
    pub async fn confirm_received(&self, event_ids: &[Uuid]) -> ServiceResult<u64> {
        let confirmed = self.store.confirm_received_to_online_web(event_ids).await?;
        debug!(requested = event_ids.len(), confirmed, "Receipt confirmed");
        Ok(confirmed)
    }

    /// Import a batch pushed by `facility_id`. Only the facility's own
    /// events are accepted.
    pub async fn receive_batch(
        &self,
        facility_id: &str,
        events: Vec<StoredEvent>,
    ) -> ServiceResult<ImportReport> {
        self.require_active(facility_id).await?;

        let (own, foreign): (Vec<_>, Vec<_>) = events
            .into_iter()
            .partition(|event| event.sender_id == facility_id);

        let mut report = self.store.import_batch(own).await?;
        for event in foreign {
            warn!(
                facility_id = %facility_id,
                event_id = %event.id,
                sender_id = %event.sender_id,
                "Refusing event pushed on behalf of another sender"
            );
            report.rejected.push(RejectedEvent {
                id: event.id,
                reason: format!("sender {} does not match pushing facility", event.sender_id),
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.imported.inc_by(report.imported.len() as u64);
        }
        if !report.awaiting_predecessors.is_empty() {
            warn!(
                facility_id = %facility_id,
                count = report.awaiting_predecessors.len(),
                "Imported group events are waiting for predecessors"
            );
        }
        if !report.imported.is_empty() {
            if let Some(trigger) = &self.replay_trigger {
                trigger.notify_one();
            }
        }

        info!(
            facility_id = %facility_id,
            imported = report.imported.len(),
            duplicates = report.duplicates.len(),
            rejected = report.rejected.len(),
            "Received batch from local machine"
        );
        Ok(report)
    }

    /// Next page of events for `facility_id` after `cursor`
    pub async fn export_for(&self, facility_id: &str, cursor: i64) -> ServiceResult<ExportBatch> {
        self.require_active(facility_id).await?;
        self.collect_for(facility_id, cursor).await
    }

    /// Events after `cursor` routed to `facility_id`, plus unconfirmed events
    /// addressed to it from earlier pages and the preceding events of every
    /// group touched, so the receiver sees each group without gaps.
    async fn collect_for(&self, facility_id: &str, cursor: i64) -> ServiceResult<ExportBatch> {
        let local = self.store.local_facility().to_string();
        let page = self.store.export_since(cursor, self.export_limit).await?;
        let next_cursor = page.next_cursor;

        let mut selected: BTreeMap<i64, StoredEvent> = BTreeMap::new();
        for event in page.retain_for(facility_id).events {
            // Undirected events travel outwards from the web only
            if event.receiver_id.is_some() || event.sender_id == local {
                selected.insert(event.position, event);
            }
        }
        for event in self.store.find_pending_for_receiver(facility_id).await? {
            if event.position <= cursor {
                selected.insert(event.position, event);
            }
        }

        let mut reach: HashMap<String, i64> = HashMap::new();
        for event in selected.values() {
            if let Some(group_id) = &event.group_id {
                let max = reach.entry(group_id.clone()).or_insert(0);
                *max = (*max).max(event.sequence);
            }
        }
        for (group_id, up_to) in reach {
            for event in self.store.find_by_group(&group_id).await? {
                if event.sequence < up_to {
                    selected.entry(event.position).or_insert(event);
                }
            }
        }

        Ok(ExportBatch {
            events: selected.into_values().collect(),
            next_cursor,
        })
    }

    /// Last contact of a facility, if activated
    pub async fn last_seen(&self, facility_id: &str) -> ServiceResult<Option<DateTime<Utc>>> {
        Ok(self.peers.find(facility_id).await?.map(|peer| peer.last_seen_at))
    }
}
