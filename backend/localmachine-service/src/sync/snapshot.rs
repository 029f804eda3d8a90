use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_store::{EventStore, StoredEvent};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::cdc::{json_to_text, quote_ident, CdcRecord, TableId};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::emitters::MasterDataEmitter;
use crate::error::{ServiceError, ServiceResult};
use crate::events::EventCategory;
use crate::services::MasterDataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastSnapshot {
    at: DateTime<Utc>,
    position: i64,
}

/// Emits a full master data snapshot when the last one is too old or too
/// many incremental changes piled up after it, whichever comes first
pub struct SnapshotScheduler<S: EventStore> {
    store: Arc<S>,
    emitter: Arc<MasterDataEmitter<S>>,
    source: Arc<dyn MasterDataSource>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    last: Mutex<Option<LastSnapshot>>,
}

impl<S: EventStore + 'static> SnapshotScheduler<S> {
    pub fn new(
        store: Arc<S>,
        emitter: Arc<MasterDataEmitter<S>>,
        source: Arc<dyn MasterDataSource>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            emitter,
            source,
            clock,
            config,
            last: Mutex::new(None),
        }
    }

    /// Last snapshot taken by this process, else the newest one in the log
    async fn last_snapshot(&self) -> ServiceResult<Option<LastSnapshot>> {
        let mut last = self.last.lock().await;
        if last.is_none() {
            *last = self
                .store
                .find_latest_matching(
                    EventCategory::MasterData.as_str(),
                    &json!({ "snapshot": true }),
                )
                .await?
                .map(|event| LastSnapshot {
                    at: event.occurred_at,
                    position: event.position,
                });
            if let Some(found) = *last {
                info!(
                    position = found.position,
                    at = %found.at,
                    "Restored last master data snapshot"
                );
            }
        }
        Ok(*last)
    }

    pub async fn is_due(&self) -> ServiceResult<bool> {
        let Some(last) = self.last_snapshot().await? else {
            return Ok(true);
        };

        let age = (self.clock.now() - last.at).to_std().unwrap_or_default();
        if age > self.config.snapshot_max_age {
            debug!(age_secs = age.as_secs(), "Master data snapshot expired");
            return Ok(true);
        }

        let changes = self
            .store
            .count_since(EventCategory::MasterData.as_str(), last.position)
            .await?;
        Ok(changes > self.config.snapshot_change_threshold)
    }

    /// Emit a snapshot if one is due
    pub async fn run_once(&self) -> ServiceResult<Option<StoredEvent>> {
        if !self.is_due().await? {
            return Ok(None);
        }

        let records = self
            .source
            .snapshot_records()
            .await
            .map_err(|e| ServiceError::Internal(format!("master data snapshot failed: {e:#}")))?;
        let stored = self.emitter.emit_snapshot(records).await?;

        *self.last.lock().await = Some(LastSnapshot {
            at: self.clock.now(),
            position: stored.position,
        });
        Ok(Some(stored))
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        info!(
            max_age_secs = self.config.snapshot_max_age.as_secs(),
            change_threshold = self.config.snapshot_change_threshold,
            "Snapshot scheduler starting"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Snapshot pass failed");
            }
        }
    }
}

/// Reads the master data tables straight from PostgreSQL
pub struct PgMasterDataSource {
    pool: PgPool,
    tables: Vec<String>,
}

impl PgMasterDataSource {
    pub fn new(pool: PgPool, tables: Vec<String>) -> Self {
        Self { pool, tables }
    }
}

/// Flatten a JSON row object into the captured-record shape
fn record_from_json(table: &str, row: Value) -> Option<CdcRecord> {
    let Value::Object(fields) = row else {
        return None;
    };

    let mut columns = Vec::with_capacity(fields.len());
    let mut values = Vec::with_capacity(fields.len());
    for (column, value) in fields {
        columns.push(column);
        values.push(json_to_text(value));
    }

    Some(CdcRecord {
        table: TableId::public(table),
        columns,
        values,
        deleted: false,
        position: 0,
    })
}

#[async_trait]
impl MasterDataSource for PgMasterDataSource {
    async fn snapshot_records(&self) -> anyhow::Result<Vec<CdcRecord>> {
        let mut records = Vec::new();
        for table in &self.tables {
            let sql = format!("SELECT to_jsonb(t) AS row FROM {} t", quote_ident(table));
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

            debug!(table = %table, rows = rows.len(), "Master data table read");
            for row in rows {
                let value: Value = row.try_get("row")?;
                records.extend(record_from_json(table, value));
            }
        }
        Ok(records)
    }
}
