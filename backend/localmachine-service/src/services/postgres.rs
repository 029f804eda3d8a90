//! PostgreSQL-backed replay services.
//!
//! Host tables touched here (`requisitions`, `proofs_of_delivery`, and the
//! tables named in captured batches) are expected to exist with an `id`
//! primary key. Engine-owned tables come from `migrations/004`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use event_store::PostgresEventStore;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BackupService, ConfirmPodRequest, FcIntegrationService, MasterDataService, PodService,
    ReplayServices, RequisitionService, RequisitionStatus, StockService,
};
use crate::auth::current_user;
use crate::cdc::{quote_ident, TableChangeEvent};
use crate::events::{
    BackupDatabaseEvent, DomainEvent, EventCategory, FcIssueVoucherEvent, FcReceiptPlanEvent,
    LocalMovementEvent, MasterDataEvent, PodConfirmedEvent,
};
use crate::publisher::EventPublisher;

pub struct PgRequisitionService {
    pool: PgPool,
}

impl PgRequisitionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequisitionService for PgRequisitionService {
    async fn find_status(&self, requisition_id: Uuid) -> Result<Option<RequisitionStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM requisitions WHERE id = $1")
                .bind(requisition_id)
                .fetch_optional(&self.pool)
                .await?;

        status
            .map(|s| s.parse::<RequisitionStatus>().map_err(|e| anyhow!(e)))
            .transpose()
    }

    async fn release_without_order(&self, requisition_id: Uuid) -> Result<()> {
        let status = RequisitionStatus::ReleasedWithoutOrder;
        let author = current_user().map(|user| user.user_id);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE requisitions SET status = $2 WHERE id = $1")
            .bind(requisition_id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            bail!("requisition {} not found", requisition_id);
        }

        sqlx::query(
            r#"
            INSERT INTO requisition_status_changes (id, requisition_id, status, author_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(requisition_id)
        .bind(status.as_str())
        .bind(author)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(requisition_id = %requisition_id, author_id = ?author, "Requisition released without order");
        Ok(())
    }
}

/// Confirms proofs of delivery. Confirmations that did not come from replay
/// are published to the online web inside the same transaction.
pub struct PgPodService {
    pool: PgPool,
    publisher: Option<(EventPublisher<PostgresEventStore>, String)>,
}

impl PgPodService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            publisher: None,
        }
    }

    /// Publish local confirmations as group events addressed to `receiver_id`
    pub fn with_publisher(
        mut self,
        publisher: EventPublisher<PostgresEventStore>,
        receiver_id: impl Into<String>,
    ) -> Self {
        self.publisher = Some((publisher, receiver_id.into()));
        self
    }

    async fn publish(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &ConfirmPodRequest,
        requisition_number: String,
    ) -> Result<()> {
        let Some((publisher, receiver_id)) = &self.publisher else {
            return Ok(());
        };
        let confirmed_by = current_user()
            .map(|user| user.user_id)
            .context("confirming a proof of delivery requires an acting user")?;

        let event = DomainEvent::PodConfirmedAndroid(PodConfirmedEvent {
            pod_id: request.pod_id,
            requisition_number: requisition_number.clone(),
            confirmed_by,
            received_by: request.received_by.clone(),
            received_date: request.received_date,
        });
        publisher
            .emit_group_event_in_tx(
                tx,
                &requisition_number,
                receiver_id,
                &event,
                EventCategory::PodConfirmedAndroid,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PodService for PgPodService {
    async fn is_confirmed(&self, pod_id: Uuid) -> Result<bool> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM proofs_of_delivery WHERE id = $1")
                .bind(pod_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(status) => Ok(status == "CONFIRMED"),
            None => bail!("proof of delivery {} not found", pod_id),
        }
    }

    async fn confirm_pod(&self, request: ConfirmPodRequest, is_replay: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let requisition_number: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE proofs_of_delivery
            SET status = 'CONFIRMED',
                received_by = $2,
                received_date = $3,
                confirmed_by = $4,
                confirmed_at = $5
            WHERE id = $1
            RETURNING requisition_number
            "#,
        )
        .bind(request.pod_id)
        .bind(&request.received_by)
        .bind(request.received_date)
        .bind(current_user().map(|user| user.user_id))
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(requisition_number) = requisition_number else {
            bail!("proof of delivery {} not found", request.pod_id);
        };

        if !is_replay {
            self.publish(&mut tx, &request, requisition_number).await?;
        }

        tx.commit().await?;
        debug!(pod_id = %request.pod_id, is_replay, "Proof of delivery confirmed");
        Ok(())
    }
}

pub struct PgFcIntegrationService {
    pool: PgPool,
}

impl PgFcIntegrationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FcIntegrationService for PgFcIntegrationService {
    async fn issue_voucher_exists(&self, issue_voucher_number: &str) -> Result<bool> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM fc_issue_vouchers WHERE issue_voucher_number = $1)",
        )
        .bind(issue_voucher_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_issue_voucher(&self, voucher: &FcIssueVoucherEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fc_issue_vouchers
                (issue_voucher_number, requisition_number, supplying_depot_code, author_id, line_items)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (issue_voucher_number) DO NOTHING
            "#,
        )
        .bind(&voucher.issue_voucher_number)
        .bind(&voucher.requisition_number)
        .bind(&voucher.supplying_depot_code)
        .bind(voucher.author_id)
        .bind(Json(&voucher.line_items))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receipt_plan_exists(&self, receipt_plan_number: &str) -> Result<bool> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM fc_receipt_plans WHERE receipt_plan_number = $1)",
        )
        .bind(receipt_plan_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_receipt_plan(&self, plan: &FcReceiptPlanEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fc_receipt_plans
                (receipt_plan_number, requisition_number, author_id, line_items)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (receipt_plan_number) DO NOTHING
            "#,
        )
        .bind(&plan.receipt_plan_number)
        .bind(&plan.requisition_number)
        .bind(plan.author_id)
        .bind(Json(&plan.line_items))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Applies captured row batches (stock movements, master data) to the local
/// tables of the same name, once per batch id
pub struct PgReplicaService {
    pool: PgPool,
}

impl PgReplicaService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn is_applied(&self, batch_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM applied_change_batches WHERE batch_id = $1)",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn apply_batch(
        &self,
        batch_id: Uuid,
        category: EventCategory,
        facility_id: &str,
        table_changes: &[TableChangeEvent],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let journaled = sqlx::query(
            r#"
            INSERT INTO applied_change_batches (batch_id, category, facility_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(category.as_str())
        .bind(facility_id)
        .execute(&mut *tx)
        .await?;
        if journaled.rows_affected() == 0 {
            debug!(batch_id = %batch_id, "Batch applied concurrently");
            return Ok(());
        }

        let mut rows = 0;
        for change in table_changes {
            let statements = RowStatements::for_table(change);
            for row in &change.row_changes {
                let record = row_json(&change.columns, &row.values);
                let sql = if row.deleted {
                    &statements.delete
                } else {
                    &statements.upsert
                };
                sqlx::query(sql)
                    .bind(record)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| {
                        format!("applying row to {}.{}", change.schema_name, change.table_name)
                    })?;
                rows += 1;
            }
        }

        tx.commit().await?;
        info!(
            batch_id = %batch_id,
            category = %category,
            facility_id = %facility_id,
            rows,
            "Captured batch applied"
        );
        Ok(())
    }
}

/// Row object keyed by column name; values stay text and are cast by
/// `json_populate_record` to the column types
fn row_json(columns: &[String], values: &[Option<String>]) -> Value {
    let fields: Map<String, Value> = columns
        .iter()
        .zip(values)
        .map(|(column, value)| {
            (
                column.clone(),
                value.clone().map_or(Value::Null, Value::String),
            )
        })
        .collect();
    Value::Object(fields)
}

struct RowStatements {
    upsert: String,
    delete: String,
}

impl RowStatements {
    fn for_table(change: &TableChangeEvent) -> Self {
        let table = format!(
            "{}.{}",
            quote_ident(&change.schema_name),
            quote_ident(&change.table_name)
        );
        let updatable: Vec<String> = change
            .columns
            .iter()
            .filter(|column| column.as_str() != "id")
            .map(|column| quote_ident(column))
            .collect();

        let on_conflict = if updatable.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!(
                "DO UPDATE SET ({}) = ROW({})",
                updatable.join(", "),
                updatable
                    .iter()
                    .map(|column| format!("EXCLUDED.{}", column))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        Self {
            upsert: format!(
                "INSERT INTO {table} SELECT * FROM json_populate_record(NULL::{table}, $1::json) \
                 ON CONFLICT (id) {on_conflict}"
            ),
            delete: format!(
                "DELETE FROM {table} WHERE id = (json_populate_record(NULL::{table}, $1::json)).id"
            ),
        }
    }
}

#[async_trait]
impl StockService for PgReplicaService {
    async fn is_movement_applied(&self, batch_id: Uuid) -> Result<bool> {
        self.is_applied(batch_id).await
    }

    async fn apply_movement(&self, movement: &LocalMovementEvent) -> Result<()> {
        self.apply_batch(
            movement.batch_id,
            EventCategory::LocalMovement,
            &movement.facility_id,
            &movement.table_changes,
        )
        .await
    }
}

#[async_trait]
impl MasterDataService for PgReplicaService {
    async fn is_batch_applied(&self, batch_id: Uuid) -> Result<bool> {
        self.is_applied(batch_id).await
    }

    async fn apply(&self, master_data: &MasterDataEvent) -> Result<()> {
        self.apply_batch(
            master_data.batch_id,
            EventCategory::MasterData,
            &master_data.facility_id,
            &master_data.table_changes,
        )
        .await
    }
}

/// Keeps facility backup batches as received
pub struct PgBackupArchive {
    pool: PgPool,
}

impl PgBackupArchive {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackupService for PgBackupArchive {
    async fn is_batch_stored(&self, batch_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM backup_batches WHERE batch_id = $1)",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn store(&self, backup: &BackupDatabaseEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_batches (batch_id, facility_id, table_changes)
            VALUES ($1, $2, $3)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(backup.batch_id)
        .bind(&backup.facility_id)
        .bind(Json(&backup.table_changes))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl ReplayServices {
    /// PostgreSQL services over `pool`. Local proof of delivery confirmations
    /// are published to `peer_id` through `publisher`.
    pub fn postgres(
        pool: PgPool,
        publisher: EventPublisher<PostgresEventStore>,
        peer_id: &str,
    ) -> Self {
        let replica = Arc::new(PgReplicaService::new(pool.clone()));
        Self {
            requisitions: Arc::new(PgRequisitionService::new(pool.clone())),
            pods: Arc::new(PgPodService::new(pool.clone()).with_publisher(publisher, peer_id)),
            fc: Arc::new(PgFcIntegrationService::new(pool.clone())),
            stock: replica.clone(),
            master_data: replica,
            backups: Arc::new(PgBackupArchive::new(pool)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::RowChangeEvent;

    fn change(columns: &[&str]) -> TableChangeEvent {
        TableChangeEvent {
            schema_name: "public".to_string(),
            table_name: "stock_card".to_string(),
            schema_version: 1,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            row_changes: vec![RowChangeEvent {
                values: vec![Some("c1".to_string()); columns.len()],
                deleted: false,
            }],
        }
    }

    #[test]
    fn test_upsert_updates_every_non_key_column() {
        let statements = RowStatements::for_table(&change(&["id", "quantity", "lot_id"]));

        assert_eq!(
            statements.upsert,
            "INSERT INTO \"public\".\"stock_card\" SELECT * FROM json_populate_record(NULL::\"public\".\"stock_card\", $1::json) \
             ON CONFLICT (id) DO UPDATE SET (\"quantity\", \"lot_id\") = ROW(EXCLUDED.\"quantity\", EXCLUDED.\"lot_id\")"
        );
        assert!(statements.delete.starts_with("DELETE FROM \"public\".\"stock_card\" WHERE id ="));
    }

    #[test]
    fn test_key_only_table_does_nothing_on_conflict() {
        let statements = RowStatements::for_table(&change(&["id"]));

        assert!(statements.upsert.ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn test_row_json_keeps_nulls() {
        let row = row_json(
            &["id".to_string(), "note".to_string()],
            &[Some("c1".to_string()), None],
        );

        assert_eq!(row, serde_json::json!({"id": "c1", "note": null}));
    }
}
