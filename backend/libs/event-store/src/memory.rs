use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EventStoreError, EventStoreResult};
use crate::model::{
    needs_replay_on, ExportBatch, ImportReport, NewEvent, RejectedEvent, StoredEvent,
};
use crate::EventStore;

/// Process-local event log with the same ordering and dedup rules as
/// [`crate::PostgresEventStore`].
///
/// The whole state sits behind one async mutex, which doubles as the
/// per-group serialization point for sequence assignment.
pub struct InMemoryEventStore {
    facility_id: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Ascending by position
    events: Vec<StoredEvent>,
    index: HashMap<Uuid, usize>,
    group_sequences: HashMap<String, i64>,
    cursors: HashMap<String, i64>,
    last_position: i64,
}

impl State {
    fn next_position(&mut self) -> i64 {
        self.last_position += 1;
        self.last_position
    }

    fn push(&mut self, event: StoredEvent) {
        self.index.insert(event.id, self.events.len());
        self.events.push(event);
    }

    fn get_mut(&mut self, event_id: Uuid) -> Option<&mut StoredEvent> {
        let idx = *self.index.get(&event_id)?;
        self.events.get_mut(idx)
    }

    fn holder_of(&self, group_id: &str, sequence: i64) -> Option<Uuid> {
        self.events
            .iter()
            .find(|e| e.group_id.as_deref() == Some(group_id) && e.sequence == sequence)
            .map(|e| e.id)
    }

    fn group_sorted(&self, group_id: &str) -> Vec<&StoredEvent> {
        let mut group: Vec<&StoredEvent> = self
            .events
            .iter()
            .filter(|e| e.group_id.as_deref() == Some(group_id))
            .collect();
        group.sort_by_key(|e| e.sequence);
        group
    }
}

fn payload_matches(payload: &serde_json::Value, filter: &serde_json::Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(key, value)| payload.get(key) == Some(value)),
        None => false,
    }
}

impl InMemoryEventStore {
    pub fn new(facility_id: impl Into<String>) -> Self {
        Self {
            facility_id: facility_id.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Snapshot of every stored event, arrival order.
    pub async fn all_events(&self) -> Vec<StoredEvent> {
        self.state.lock().await.events.clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn local_facility(&self) -> &str {
        &self.facility_id
    }

    async fn append(&self, event: NewEvent) -> EventStoreResult<StoredEvent> {
        let mut state = self.state.lock().await;

        if let Some(&idx) = state.index.get(&event.id) {
            debug!(event_id = %event.id, "Event already in log, append is a no-op");
            return Ok(state.events[idx].clone());
        }

        let position = state.next_position();
        let sequence = match &event.group_id {
            Some(group_id) => {
                let last = state.group_sequences.entry(group_id.clone()).or_insert(0);
                *last += 1;
                *last
            }
            None => position,
        };

        let stored = StoredEvent {
            id: event.id,
            position,
            replayed: !needs_replay_on(
                &event.sender_id,
                event.receiver_id.as_deref(),
                &self.facility_id,
            ),
            acknowledged: false,
            group_id: event.group_id,
            sequence,
            sender_id: event.sender_id,
            receiver_id: event.receiver_id,
            category: event.category,
            payload: event.payload,
            occurred_at: event.occurred_at,
        };
        state.push(stored.clone());

        debug!(
            event_id = %stored.id,
            category = %stored.category,
            group_id = ?stored.group_id,
            sequence = stored.sequence,
            "Event appended to log"
        );

        Ok(stored)
    }

    async fn import_batch(&self, events: Vec<StoredEvent>) -> EventStoreResult<ImportReport> {
        let mut state = self.state.lock().await;
        let mut report = ImportReport::default();
        let mut imported_groups: Vec<(Uuid, String, i64)> = Vec::new();

        for event in events {
            if state.index.contains_key(&event.id) {
                report.duplicates.push(event.id);
                continue;
            }

            if let Some(group_id) = &event.group_id {
                if let Some(existing) = state.holder_of(group_id, event.sequence) {
                    report.rejected.push(RejectedEvent {
                        id: event.id,
                        reason: EventStoreError::SequenceCollision {
                            group_id: group_id.clone(),
                            sequence: event.sequence,
                            existing,
                        }
                        .to_string(),
                    });
                    continue;
                }
                let last = state.group_sequences.entry(group_id.clone()).or_insert(0);
                *last = (*last).max(event.sequence);
                imported_groups.push((event.id, group_id.clone(), event.sequence));
            }

            let position = state.next_position();
            let replayed = !needs_replay_on(
                &event.sender_id,
                event.receiver_id.as_deref(),
                &self.facility_id,
            );
            report.imported.push(event.id);
            state.push(StoredEvent {
                position,
                replayed,
                acknowledged: false,
                ..event
            });
        }

        for (id, group_id, sequence) in imported_groups {
            let predecessors = state
                .events
                .iter()
                .filter(|e| e.group_id.as_deref() == Some(group_id.as_str()) && e.sequence < sequence)
                .count() as i64;
            if predecessors != sequence - 1 {
                report.awaiting_predecessors.push(id);
            }
        }

        debug!(
            imported = report.imported.len(),
            duplicates = report.duplicates.len(),
            awaiting = report.awaiting_predecessors.len(),
            rejected = report.rejected.len(),
            "Imported peer batch"
        );

        Ok(report)
    }

    async fn find_by_id(&self, event_id: Uuid) -> EventStoreResult<Option<StoredEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .index
            .get(&event_id)
            .and_then(|idx| state.events.get(*idx))
            .cloned())
    }

    async fn find_by_group(&self, group_id: &str) -> EventStoreResult<Vec<StoredEvent>> {
        let state = self.state.lock().await;
        Ok(state.group_sorted(group_id).into_iter().cloned().collect())
    }

    async fn find_unreplayed_by_group_ordered(
        &self,
        group_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .group_sorted(group_id)
            .into_iter()
            .filter(|e| !e.replayed)
            .cloned()
            .collect())
    }

    async fn last_replayed_sequence(&self, group_id: &str) -> EventStoreResult<i64> {
        let state = self.state.lock().await;
        let mut watermark = 0;
        for event in state.group_sorted(group_id) {
            if event.sequence != watermark + 1 || !event.replayed {
                break;
            }
            watermark = event.sequence;
        }
        Ok(watermark)
    }

    async fn find_replay_candidates(&self, limit: i64) -> EventStoreResult<Vec<StoredEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| !e.replayed)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_replayed(&self, event_id: Uuid) -> EventStoreResult<()> {
        let mut state = self.state.lock().await;
        let event = state
            .get_mut(event_id)
            .ok_or(EventStoreError::EventNotFound(event_id))?;
        event.replayed = true;
        Ok(())
    }

    async fn find_pending_for_receiver(
        &self,
        receiver_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| !e.acknowledged && e.receiver_id.as_deref() == Some(receiver_id))
            .cloned()
            .collect())
    }

    async fn find_unacknowledged_sent_by(
        &self,
        sender_id: &str,
        limit: i64,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| !e.acknowledged && e.sender_id == sender_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn confirm_received_to_online_web(&self, event_ids: &[Uuid]) -> EventStoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for id in event_ids {
            if let Some(event) = state.get_mut(*id) {
                if !event.acknowledged {
                    event.acknowledged = true;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn export_since(&self, cursor: i64, limit: i64) -> EventStoreResult<ExportBatch> {
        let state = self.state.lock().await;
        let events: Vec<StoredEvent> = state
            .events
            .iter()
            .filter(|e| e.position > cursor)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        let next_cursor = events.last().map_or(cursor, |e| e.position);
        Ok(ExportBatch {
            events,
            next_cursor,
        })
    }

    async fn count_since(&self, category: &str, after_position: i64) -> EventStoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.category == category && e.position > after_position)
            .count() as i64)
    }

    async fn find_latest_matching(
        &self,
        category: &str,
        filter: &serde_json::Value,
    ) -> EventStoreResult<Option<StoredEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .rev()
            .find(|e| e.category == category && payload_matches(&e.payload, filter))
            .cloned())
    }

    async fn latest_position(&self) -> EventStoreResult<i64> {
        Ok(self.state.lock().await.last_position)
    }

    async fn load_cursor(&self, peer_id: &str) -> EventStoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state.cursors.get(peer_id).copied().unwrap_or(0))
    }

    async fn save_cursor(&self, peer_id: &str, position: i64) -> EventStoreResult<()> {
        let mut state = self.state.lock().await;
        let cursor = state.cursors.entry(peer_id.to_string()).or_insert(0);
        *cursor = (*cursor).max(position);
        Ok(())
    }

    async fn pending_stats(&self) -> EventStoreResult<(i64, i64)> {
        let state = self.state.lock().await;
        let pending = state.events.iter().filter(|e| !e.replayed).count() as i64;
        let unacknowledged = state
            .events
            .iter()
            .filter(|e| !e.acknowledged && e.sender_id == self.facility_id)
            .count() as i64;
        Ok((pending, unacknowledged))
    }
}
