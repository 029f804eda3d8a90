//! Logical decoding of the local database through a `wal2json` slot.
//!
//! The slot is read with `pg_logical_slot_peek_changes`, so nothing is
//! consumed until the [`super::CdcConsumer`] has saved a position: every
//! poll first advances the slot to the last saved offset. Changes come
//! back as whole transactions and are cut into one [`CdcBatch`] each.

use serde::Deserialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{json_to_text, quote_ident, CdcBatch, CdcRecord, OffsetStore, TableId};
use crate::error::{ServiceError, ServiceResult};

const OUTPUT_PLUGIN: &str = "wal2json";
const MAX_BACKOFF_SECS: u64 = 60;

/// One line of wal2json format-version 2 output
#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    /// B(egin), C(ommit), I(nsert), U(pdate), D(elete), T(runcate), M(essage)
    action: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
    /// Old key (or full old row) for updates and deletes
    #[serde(default)]
    identity: Vec<Wal2JsonColumn>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(default)]
    value: Value,
}

/// Decoded slot row: LSN as a byte offset plus the plugin output
#[derive(Debug, Clone)]
pub struct SlotChange {
    pub position: i64,
    pub data: String,
}

/// Cut slot output into per-transaction batches.
///
/// Every record of a transaction carries the commit position. Changes after
/// the last commit (an incomplete transaction) are dropped; they come back
/// on the next read.
pub fn batches_from_changes(changes: &[SlotChange]) -> ServiceResult<Vec<CdcBatch>> {
    let mut batches = Vec::new();
    let mut open: Vec<CdcRecord> = Vec::new();

    for change in changes {
        let decoded: Wal2JsonChange = serde_json::from_str(&change.data)?;
        match decoded.action.as_str() {
            "B" => open.clear(),
            "C" => {
                let mut records = std::mem::take(&mut open);
                if records.is_empty() {
                    continue;
                }
                for record in &mut records {
                    record.position = change.position;
                }
                batches.push(CdcBatch::new(records));
            }
            action @ ("I" | "U" | "D") => {
                let (Some(schema), Some(table)) = (decoded.schema, decoded.table) else {
                    return Err(ServiceError::Internal(format!(
                        "wal2json {action} change without table at position {}",
                        change.position
                    )));
                };
                let deleted = action == "D";
                let fields = if deleted {
                    decoded.identity
                } else {
                    decoded.columns
                };

                let (columns, values): (Vec<String>, Vec<Option<String>>) = fields
                    .into_iter()
                    .map(|column| (column.name, json_to_text(column.value)))
                    .unzip();
                open.push(CdcRecord {
                    table: TableId::new(schema, table),
                    columns,
                    values,
                    deleted,
                    position: change.position,
                });
            }
            other => {
                debug!(action = other, position = change.position, "Ignoring wal2json entry");
            }
        }
    }

    Ok(batches)
}

pub struct PgLogicalCapture {
    pool: PgPool,
    offsets: Arc<dyn OffsetStore>,
    slot_name: String,
    publication_name: String,
    tables: Vec<String>,
    poll_interval: Duration,
    max_changes: i64,
}

impl PgLogicalCapture {
    pub fn new(
        pool: PgPool,
        offsets: Arc<dyn OffsetStore>,
        slot_name: impl Into<String>,
        publication_name: impl Into<String>,
        tables: Vec<String>,
    ) -> Self {
        Self {
            pool,
            offsets,
            slot_name: slot_name.into(),
            publication_name: publication_name.into(),
            tables,
            poll_interval: Duration::from_secs(1),
            max_changes: 1000,
        }
    }

    pub fn with_limits(mut self, poll_interval: Duration, max_changes: i64) -> Self {
        self.poll_interval = poll_interval;
        self.max_changes = max_changes;
        self
    }

    /// Create the publication over the watched tables and the slot, when missing
    pub async fn ensure_slot(&self) -> ServiceResult<()> {
        let publication_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = $1)",
        )
        .bind(&self.publication_name)
        .fetch_one(&self.pool)
        .await?;

        if !publication_exists {
            let existing: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT t FROM unnest($1::text[]) AS t
                WHERE to_regclass(quote_ident(t)) IS NOT NULL
                "#,
            )
            .bind(&self.tables)
            .fetch_all(&self.pool)
            .await?;

            if existing.is_empty() {
                return Err(ServiceError::Config(
                    "none of the watched tables exist".to_string(),
                ));
            }
            if existing.len() < self.tables.len() {
                warn!(
                    watched = self.tables.len(),
                    existing = existing.len(),
                    "Some watched tables do not exist and are not captured"
                );
            }

            let table_list = existing
                .iter()
                .map(|t| quote_ident(t))
                .collect::<Vec<_>>()
                .join(", ");
            let create = format!(
                "CREATE PUBLICATION {} FOR TABLE {}",
                quote_ident(&self.publication_name),
                table_list
            );
            sqlx::query(&create).execute(&self.pool).await?;
            info!(
                publication = %self.publication_name,
                tables = existing.len(),
                "Publication created"
            );
        }

        let slot_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
        )
        .bind(&self.slot_name)
        .fetch_one(&self.pool)
        .await?;

        if !slot_exists {
            sqlx::query("SELECT pg_create_logical_replication_slot($1, $2)")
                .bind(&self.slot_name)
                .bind(OUTPUT_PLUGIN)
                .execute(&self.pool)
                .await?;
            info!(slot = %self.slot_name, plugin = OUTPUT_PLUGIN, "Replication slot created");
        }
        Ok(())
    }

    /// `schema.table` list of the publication, as wal2json's `add-tables` filter
    async fn table_filter(&self) -> ServiceResult<String> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT schemaname || '.' || tablename
            FROM pg_publication_tables
            WHERE pubname = $1
            ORDER BY 1
            "#,
        )
        .bind(&self.publication_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(tables.join(","))
    }

    /// Release WAL up to the last position the consumer saved
    async fn advance_to_saved(&self) -> ServiceResult<()> {
        let Some(position) = self.offsets.read_offset(&self.slot_name).await? else {
            return Ok(());
        };

        sqlx::query(
            r#"
            SELECT pg_replication_slot_advance(slot_name, '0/0'::pg_lsn + $2::bigint::numeric)
            FROM pg_replication_slots
            WHERE slot_name = $1
              AND confirmed_flush_lsn < '0/0'::pg_lsn + $2::bigint::numeric
            "#,
        )
        .bind(&self.slot_name)
        .bind(position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read pending transactions without consuming them
    pub async fn poll(&self, filter: &str) -> ServiceResult<Vec<CdcBatch>> {
        self.advance_to_saved().await?;

        let rows = sqlx::query(
            r#"
            SELECT (lsn - '0/0'::pg_lsn)::bigint AS position, data
            FROM pg_logical_slot_peek_changes(
                $1, NULL, $2::int,
                'format-version', '2',
                'include-transaction', 'true',
                'add-tables', $3
            )
            "#,
        )
        .bind(&self.slot_name)
        .bind(self.max_changes)
        .bind(filter)
        .fetch_all(&self.pool)
        .await?;

        let changes = rows
            .iter()
            .map(|row| {
                Ok(SlotChange {
                    position: row.try_get("position")?,
                    data: row.try_get("data")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        batches_from_changes(&changes)
    }

    /// Poll the slot and forward new batches until the consumer goes away
    pub async fn run(self, batches: mpsc::Sender<CdcBatch>) -> anyhow::Result<()> {
        self.ensure_slot().await?;
        let filter = self.table_filter().await?;
        info!(
            slot = %self.slot_name,
            publication = %self.publication_name,
            tables = %filter,
            "Starting CDC capture"
        );

        let mut last_sent = self.offsets.read_offset(&self.slot_name).await?;
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.poll(&filter).await {
                Ok(polled) => {
                    consecutive_errors = 0;
                    for batch in polled {
                        let Some(position) = batch.last_position() else {
                            continue;
                        };
                        if matches!(last_sent, Some(sent) if position <= sent) {
                            continue;
                        }
                        if batches.send(batch).await.is_err() {
                            info!(slot = %self.slot_name, "CDC consumer gone, capture stopping");
                            return Ok(());
                        }
                        last_sent = Some(position);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_secs(
                        2u64.saturating_pow(consecutive_errors - 1)
                            .min(MAX_BACKOFF_SECS),
                    );
                    error!(
                        slot = %self.slot_name,
                        consecutive_errors,
                        backoff_secs = backoff.as_secs(),
                        "Failed to read replication slot: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
