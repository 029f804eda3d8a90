//! Emission of domain events into the local log.
//!
//! Group events get the next sequence of their group from the store, which
//! serializes concurrent appenders of one group. When that step loses a race
//! the publisher retries it a bounded number of times; every other failure is
//! returned immediately.

use event_store::metrics::EventLogMetrics;
use event_store::{EventStore, EventStoreError, NewEvent, PostgresEventStore, StoredEvent};
use resilience::{with_retry_if, RetryConfig};
use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::events::{DomainEvent, EventCategory};

pub struct EventPublisher<S: EventStore> {
    store: Arc<S>,
    retry: RetryConfig,
    metrics: Option<EventLogMetrics>,
}

impl<S: EventStore> Clone for EventPublisher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: EventStore> EventPublisher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            retry: RetryConfig::contention(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: EventLogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Facility stamped as sender on everything this publisher emits
    pub fn facility_id(&self) -> &str {
        self.store.local_facility()
    }

    /// Append `event` as the next event of `group_id`, to be replayed on
    /// `receiver_id`.
    pub async fn emit_group_event(
        &self,
        group_id: &str,
        receiver_id: &str,
        event: &DomainEvent,
        category: EventCategory,
    ) -> ServiceResult<StoredEvent> {
        let new_event = self
            .build(event, category)?
            .with_group(group_id)
            .with_receiver(receiver_id);
        let stored = self.append_with_retry(new_event).await?;

        info!(
            event_id = %stored.id,
            category = %category,
            group_id = %group_id,
            receiver_id = %receiver_id,
            sequence = stored.sequence,
            "Group event emitted"
        );
        Ok(stored)
    }

    /// Append an event with no group and no dedicated receiver
    pub async fn emit_non_group_event(
        &self,
        event: &DomainEvent,
        category: EventCategory,
    ) -> ServiceResult<StoredEvent> {
        let new_event = self.build(event, category)?;
        let stored = self.append_with_retry(new_event).await?;

        debug!(
            event_id = %stored.id,
            category = %category,
            position = stored.position,
            "Non-group event emitted"
        );
        Ok(stored)
    }

    /// [`Self::emit_non_group_event`] with the category taken from the event kind
    pub async fn emit_non_group(&self, event: &DomainEvent) -> ServiceResult<StoredEvent> {
        self.emit_non_group_event(event, event.category()).await
    }

    /// [`Self::emit_non_group`] under an id derived from the event's source.
    /// Emitting the same id again returns the event already in the log.
    pub async fn emit_non_group_with_id(
        &self,
        event: &DomainEvent,
        event_id: Uuid,
    ) -> ServiceResult<StoredEvent> {
        let new_event = self.build(event, event.category())?.with_id(event_id);
        let stored = self.append_with_retry(new_event).await?;

        debug!(
            event_id = %stored.id,
            category = %event.category(),
            position = stored.position,
            "Non-group event emitted"
        );
        Ok(stored)
    }

    fn build(&self, event: &DomainEvent, category: EventCategory) -> ServiceResult<NewEvent> {
        if event.category() != category {
            return Err(ServiceError::Internal(format!(
                "{} event emitted under category {}",
                event.category(),
                category
            )));
        }
        Ok(NewEvent::new(
            self.facility_id(),
            category.as_str(),
            event.to_payload()?,
        ))
    }

    async fn append_with_retry(&self, new_event: NewEvent) -> ServiceResult<StoredEvent> {
        let store = self.store.clone();
        let stored = with_retry_if(
            self.retry.clone(),
            |e: &EventStoreError| e.is_conflict(),
            move || {
                let store = store.clone();
                let event = new_event.clone();
                async move { store.append(event).await }
            },
        )
        .await
        .map_err(|e| ServiceError::EventStore(e.into_inner()))?;

        if let Some(metrics) = &self.metrics {
            metrics.appended.inc();
        }
        Ok(stored)
    }
}

impl EventPublisher<PostgresEventStore> {
    /// Append a group event inside the caller's business transaction.
    ///
    /// Nothing is retried here: on [`ServiceError::is_conflict`] the caller
    /// rolls back and retries the whole transaction.
    pub async fn emit_group_event_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        group_id: &str,
        receiver_id: &str,
        event: &DomainEvent,
        category: EventCategory,
    ) -> ServiceResult<StoredEvent> {
        let new_event = self
            .build(event, category)?
            .with_group(group_id)
            .with_receiver(receiver_id);
        let stored = self.store.append_in_tx(tx, new_event).await?;

        if let Some(metrics) = &self.metrics {
            metrics.appended.inc();
        }
        info!(
            event_id = %stored.id,
            category = %category,
            group_id = %group_id,
            sequence = stored.sequence,
            "Group event emitted in transaction"
        );
        Ok(stored)
    }

    pub async fn emit_non_group_event_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &DomainEvent,
        category: EventCategory,
    ) -> ServiceResult<StoredEvent> {
        let new_event = self.build(event, category)?;
        let stored = self.store.append_in_tx(tx, new_event).await?;

        if let Some(metrics) = &self.metrics {
            metrics.appended.inc();
        }
        Ok(stored)
    }
}
