use dashmap::DashMap;
use event_store::metrics::EventLogMetrics;
use event_store::{EventStore, StoredEvent};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{ReplayError, ReplayOutcome, Replayer};
use crate::events::{entity_key, DomainEvent, EventCategory};

/// Result of draining one group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReplay {
    pub replayed: usize,
    /// First sequence that could not be replayed because its predecessor is missing
    pub waiting_for: Option<i64>,
}

/// Result of one [`ReplayDispatcher::replay_pending`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub failed: usize,
    /// Groups stopped at a missing predecessor
    pub blocked_groups: Vec<String>,
}

pub struct ReplayDispatcher<S: EventStore> {
    store: Arc<S>,
    replayers: HashMap<EventCategory, Arc<dyn Replayer>>,
    group_locks: DashMap<String, Arc<Mutex<()>>>,
    non_group_lock: Mutex<()>,
    metrics: Option<EventLogMetrics>,
}

impl<S: EventStore> ReplayDispatcher<S> {
    /// Build the category lookup table. A later replayer for the same
    /// category replaces an earlier one.
    pub fn new(store: Arc<S>, replayers: Vec<Arc<dyn Replayer>>) -> Self {
        let mut table = HashMap::new();
        for replayer in replayers {
            if let Some(previous) = table.insert(replayer.category(), replayer) {
                warn!(category = %previous.category(), "Replacing registered replayer");
            }
        }

        Self {
            store,
            replayers: table,
            group_locks: DashMap::new(),
            non_group_lock: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EventLogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn handles(&self, category: EventCategory) -> bool {
        self.replayers.contains_key(&category)
    }

    fn group_lock(&self, group_id: &str) -> Arc<Mutex<()>> {
        self.group_locks
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Replay one event and mark it replayed.
    ///
    /// Ordering is the caller's business; use [`Self::replay_group`] for
    /// group events.
    pub async fn replay_event(&self, stored: &StoredEvent) -> Result<ReplayOutcome, ReplayError> {
        let event = DomainEvent::try_from(stored).map_err(|e| {
            error!(event_id = %stored.id, category = %stored.category, "Undecodable event: {}", e);
            ReplayError::Decode {
                event_id: stored.id,
                reason: e.to_string(),
            }
        })?;

        let replayer = self
            .replayers
            .get(&event.category())
            .ok_or(ReplayError::NoReplayer(event.category()))?;

        let outcome = match replayer.replay(stored, &event).await {
            Ok(outcome) => outcome,
            Err(source) => {
                let entity_key = entity_key(&event);
                error!(
                    event_id = %stored.id,
                    group_id = ?stored.group_id,
                    sequence = stored.sequence,
                    entity_key = %entity_key,
                    category = %stored.category,
                    error = %source,
                    "Replay failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.replay_failures.inc();
                }
                return Err(ReplayError::Failed {
                    event_id: stored.id,
                    group_id: stored.group_id.clone(),
                    entity_key,
                    source,
                });
            }
        };

        self.store.mark_replayed(stored.id).await?;
        if let Some(metrics) = &self.metrics {
            metrics.replayed.inc();
        }

        debug!(
            event_id = %stored.id,
            group_id = ?stored.group_id,
            sequence = stored.sequence,
            outcome = ?outcome,
            "Event replayed"
        );
        Ok(outcome)
    }

    /// Replay the outstanding events of a group in ascending sequence.
    ///
    /// Stops before the first event whose predecessor is not yet replayed
    /// here (missing or failed) and at the first failure, which is returned.
    pub async fn replay_group(&self, group_id: &str) -> Result<GroupReplay, ReplayError> {
        let lock = self.group_lock(group_id);
        let _guard = lock.lock().await;

        let mut watermark = self.store.last_replayed_sequence(group_id).await?;
        let pending = self.store.find_unreplayed_by_group_ordered(group_id).await?;
        let mut report = GroupReplay::default();

        for event in pending {
            if event.sequence != watermark + 1 {
                debug!(
                    group_id = %group_id,
                    watermark,
                    next_sequence = event.sequence,
                    "Group replay waiting for predecessor"
                );
                report.waiting_for = Some(event.sequence);
                break;
            }

            self.replay_event(&event).await?;
            report.replayed += 1;
            watermark = self.store.last_replayed_sequence(group_id).await?;
        }

        Ok(report)
    }

    /// Replay non-group events in the given (arrival) order. A failure does
    /// not hold back later events; failed ones stay pending.
    pub async fn replay_non_group(&self, events: &[StoredEvent]) -> (usize, usize) {
        let _guard = self.non_group_lock.lock().await;
        let mut replayed = 0;
        let mut failed = 0;

        for event in events {
            match self.replay_event(event).await {
                Ok(_) => replayed += 1,
                Err(_) => failed += 1,
            }
        }
        (replayed, failed)
    }

    /// Drain everything currently awaiting replay on this node. Groups are
    /// replayed concurrently with each other; non-group events in arrival order.
    pub async fn replay_pending(&self, limit: i64) -> Result<ReplaySummary, ReplayError> {
        let candidates = self.store.find_replay_candidates(limit).await?;

        let mut seen = HashSet::new();
        let mut groups = Vec::new();
        let mut non_group = Vec::new();
        for event in candidates {
            match &event.group_id {
                Some(group_id) => {
                    if seen.insert(group_id.clone()) {
                        groups.push(group_id.clone());
                    }
                }
                None => non_group.push(event),
            }
        }

        let mut summary = ReplaySummary::default();

        let results = join_all(groups.iter().map(|g| self.replay_group(g))).await;
        for (group_id, result) in groups.iter().zip(results) {
            match result {
                Ok(report) => {
                    summary.replayed += report.replayed;
                    if report.waiting_for.is_some() {
                        summary.blocked_groups.push(group_id.clone());
                    }
                }
                Err(e) => {
                    warn!(group_id = %group_id, "Group replay stopped: {}", e);
                    summary.failed += 1;
                }
            }
        }

        let (replayed, failed) = self.replay_non_group(&non_group).await;
        summary.replayed += replayed;
        summary.failed += failed;

        if summary.replayed > 0 || summary.failed > 0 {
            info!(
                replayed = summary.replayed,
                failed = summary.failed,
                blocked_groups = summary.blocked_groups.len(),
                "Replay pass finished"
            );
        }
        Ok(summary)
    }
}
