//! CDC listeners that turn captured row changes into log events.
//!
//! Each emitter owns a fixed table set and emits at most one non-group event
//! per captured batch. The event id and batch id are derived from the
//! batch's commit position, so a redelivered batch is absorbed by the log.

use async_trait::async_trait;
use event_store::{EventStore, StoredEvent};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cdc::{CdcListener, CdcRecord, CdcRecordMapper};
use crate::error::ServiceResult;
use crate::events::DomainEvent;
use crate::publisher::EventPublisher;

/// Stock movement tables captured on a local machine
pub const LOCAL_MOVEMENT_TABLES: [&str; 6] = [
    "stock_event",
    "stock_event_line_item",
    "stock_card",
    "stock_card_line_item",
    "physical_inventory",
    "physical_inventory_line_item",
];

pub struct LocalMovementEventEmitter<S: EventStore> {
    publisher: EventPublisher<S>,
}

impl<S: EventStore> LocalMovementEventEmitter<S> {
    pub fn new(publisher: EventPublisher<S>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl<S: EventStore + 'static> CdcListener for LocalMovementEventEmitter<S> {
    fn name(&self) -> &str {
        "local-movement"
    }

    fn accepted_tables(&self) -> Vec<String> {
        LOCAL_MOVEMENT_TABLES.iter().map(|t| t.to_string()).collect()
    }

    async fn on(&self, records: Vec<CdcRecord>) -> ServiceResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let facility_id = self.publisher.facility_id();
        let batch_id = CdcRecordMapper::capture_id(facility_id, self.name(), &records);
        let movement = CdcRecordMapper::to_local_movement_event(facility_id, batch_id, &records)?;
        let stored = self
            .publisher
            .emit_non_group_with_id(&DomainEvent::LocalMovement(movement), batch_id)
            .await?;

        debug!(
            event_id = %stored.id,
            batch_id = %batch_id,
            rows = records.len(),
            "Local movement captured"
        );
        Ok(())
    }
}

/// Ships changes of the configured tables so the web keeps a copy of the
/// facility database
pub struct BackupDatabaseEmitter<S: EventStore> {
    publisher: EventPublisher<S>,
    tables: Vec<String>,
}

impl<S: EventStore> BackupDatabaseEmitter<S> {
    pub fn new(publisher: EventPublisher<S>, tables: Vec<String>) -> Self {
        Self { publisher, tables }
    }
}

#[async_trait]
impl<S: EventStore + 'static> CdcListener for BackupDatabaseEmitter<S> {
    fn name(&self) -> &str {
        "backup-database"
    }

    fn accepted_tables(&self) -> Vec<String> {
        self.tables.clone()
    }

    async fn on(&self, records: Vec<CdcRecord>) -> ServiceResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let facility_id = self.publisher.facility_id();
        let batch_id = CdcRecordMapper::capture_id(facility_id, self.name(), &records);
        let backup = CdcRecordMapper::to_backup_database_event(facility_id, batch_id, &records)?;
        let stored = self
            .publisher
            .emit_non_group_with_id(&DomainEvent::BackupDatabase(backup), batch_id)
            .await?;

        debug!(event_id = %stored.id, rows = records.len(), "Backup batch captured");
        Ok(())
    }
}

pub struct MasterDataEmitter<S: EventStore> {
    publisher: EventPublisher<S>,
    tables: Vec<String>,
}

impl<S: EventStore> MasterDataEmitter<S> {
    pub fn new(publisher: EventPublisher<S>, tables: Vec<String>) -> Self {
        Self { publisher, tables }
    }

    /// Emit a full dump of the master data tables as one snapshot event
    pub async fn emit_snapshot(&self, records: Vec<CdcRecord>) -> ServiceResult<StoredEvent> {
        let snapshot = CdcRecordMapper::to_master_data_event(
            self.publisher.facility_id(),
            Uuid::new_v4(),
            &records,
            true,
        )?;
        let tables = snapshot.table_changes.len();
        let stored = self
            .publisher
            .emit_non_group(&DomainEvent::MasterData(snapshot))
            .await?;

        info!(
            event_id = %stored.id,
            position = stored.position,
            tables,
            rows = records.len(),
            "Master data snapshot emitted"
        );
        Ok(stored)
    }
}

#[async_trait]
impl<S: EventStore + 'static> CdcListener for MasterDataEmitter<S> {
    fn name(&self) -> &str {
        "master-data"
    }

    fn accepted_tables(&self) -> Vec<String> {
        self.tables.clone()
    }

    async fn on(&self, records: Vec<CdcRecord>) -> ServiceResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let facility_id = self.publisher.facility_id();
        let batch_id = CdcRecordMapper::capture_id(facility_id, self.name(), &records);
        let master_data =
            CdcRecordMapper::to_master_data_event(facility_id, batch_id, &records, false)?;
        let stored = self
            .publisher
            .emit_non_group_with_id(&DomainEvent::MasterData(master_data), batch_id)
            .await?;

        debug!(event_id = %stored.id, rows = records.len(), "Master data change captured");
        Ok(())
    }
}
