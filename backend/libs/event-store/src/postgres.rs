use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgExecutor, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EventStoreError, EventStoreResult};
use crate::model::{
    needs_replay_on, ExportBatch, ImportReport, NewEvent, RejectedEvent, StoredEvent,
};
use crate::EventStore;

/// Next sequence of a group. The upsert row lock serializes concurrent
/// appenders of the same group until the surrounding transaction ends.
const NEXT_GROUP_SEQUENCE: &str = r#"
    INSERT INTO event_group_sequences (group_id, last_sequence)
    VALUES ($1, 1)
    ON CONFLICT (group_id)
    DO UPDATE SET last_sequence = event_group_sequences.last_sequence + 1
    RETURNING last_sequence
"#;

/// Advisory lock key guarding the log tail. Held from position assignment
/// to commit, so positions become visible in ascending order and a cursor
/// saved after an export never skips a row that commits later.
const LOG_TAIL_LOCK: i64 = 0x6c6d_5f65_7665_6e74;

const SELECT_BY_ID: &str = r#"
    SELECT
        id, position, group_id, sequence, sender_id, receiver_id,
        category, payload, occurred_at, replayed, acknowledged
    FROM events
    WHERE id = $1
"#;

async fn lock_log_tail(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(LOG_TAIL_LOCK)
        .execute(conn)
        .await?;
    Ok(())
}

async fn fetch_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    event_id: Uuid,
) -> Result<Option<StoredEvent>, sqlx::Error> {
    sqlx::query(SELECT_BY_ID)
        .bind(event_id)
        .fetch_optional(executor)
        .await?
        .as_ref()
        .map(event_from_row)
        .transpose()
}

/// PostgreSQL backed event log.
pub struct PostgresEventStore {
    pool: PgPool,
    facility_id: String,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, facility_id: impl Into<String>) -> Self {
        Self {
            pool,
            facility_id: facility_id.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append an event inside the caller's transaction.
    ///
    /// The event becomes visible together with the caller's business writes,
    /// or not at all. The log tail lock and the group sequence lock are held
    /// until the caller commits. An id already in the log returns the stored
    /// event unchanged.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewEvent,
    ) -> EventStoreResult<StoredEvent> {
        let group_id = event.group_id.clone();

        lock_log_tail(&mut **tx).await?;
        if let Some(existing) = fetch_by_id(&mut **tx, event.id).await? {
            debug!(event_id = %event.id, "Event already in log, append is a no-op");
            return Ok(existing);
        }

        let position: i64 =
            sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('events', 'position'))")
                .fetch_one(&mut **tx)
                .await?;

        let sequence = match group_id.as_deref() {
            Some(group) => sqlx::query_scalar::<_, i64>(NEXT_GROUP_SEQUENCE)
                .bind(group)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| EventStoreError::from_append(e, event.id, Some(group)))?,
            None => position,
        };

        let replayed = !needs_replay_on(
            &event.sender_id,
            event.receiver_id.as_deref(),
            &self.facility_id,
        );

        let row = sqlx::query(
            r#"
            INSERT INTO events (
                id,
                position,
                group_id,
                sequence,
                sender_id,
                receiver_id,
                category,
                payload,
                occurred_at,
                replayed,
                acknowledged
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE)
            RETURNING
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            "#,
        )
        .bind(event.id)
        .bind(position)
        .bind(&event.group_id)
        .bind(sequence)
        .bind(&event.sender_id)
        .bind(&event.receiver_id)
        .bind(&event.category)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(replayed)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| EventStoreError::from_append(e, event.id, group_id.as_deref()))?;

        let stored = event_from_row(&row)?;

        debug!(
            event_id = %stored.id,
            category = %stored.category,
            group_id = ?stored.group_id,
            sequence = stored.sequence,
            "Event appended to log"
        );

        Ok(stored)
    }

    async fn import_one(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &StoredEvent,
    ) -> EventStoreResult<ImportOutcome> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM events WHERE id = $1)")
            .bind(event.id)
            .fetch_one(&mut **tx)
            .await?;
        if exists {
            return Ok(ImportOutcome::Duplicate);
        }

        if let Some(group_id) = &event.group_id {
            let holder: Option<Uuid> =
                sqlx::query_scalar("SELECT id FROM events WHERE group_id = $1 AND sequence = $2")
                    .bind(group_id)
                    .bind(event.sequence)
                    .fetch_optional(&mut **tx)
                    .await?;
            if let Some(existing) = holder {
                return Ok(ImportOutcome::Rejected(
                    EventStoreError::SequenceCollision {
                        group_id: group_id.clone(),
                        sequence: event.sequence,
                        existing,
                    }
                    .to_string(),
                ));
            }
        }

        let replayed = !needs_replay_on(
            &event.sender_id,
            event.receiver_id.as_deref(),
            &self.facility_id,
        );

        let inserted = sqlx::query(
            r#"
            INSERT INTO events (
                id,
                group_id,
                sequence,
                sender_id,
                receiver_id,
                category,
                payload,
                occurred_at,
                replayed,
                acknowledged
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.group_id)
        .bind(event.sequence)
        .bind(&event.sender_id)
        .bind(&event.receiver_id)
        .bind(&event.category)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(replayed)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Ok(ImportOutcome::Duplicate);
        }

        if let Some(group_id) = &event.group_id {
            sqlx::query(
                r#"
                INSERT INTO event_group_sequences (group_id, last_sequence)
                VALUES ($1, $2)
                ON CONFLICT (group_id)
                DO UPDATE SET last_sequence = GREATEST(event_group_sequences.last_sequence, EXCLUDED.last_sequence)
                "#,
            )
            .bind(group_id)
            .bind(event.sequence)
            .execute(&mut **tx)
            .await?;
        }

        Ok(ImportOutcome::Imported)
    }

    async fn fetch_events(
        &self,
        sql: &str,
        bind_text: Option<&str>,
        bind_int: Option<i64>,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        let mut query = sqlx::query(sql);
        if let Some(text) = bind_text {
            query = query.bind(text);
        }
        if let Some(int) = bind_int {
            query = query.bind(int);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(EventStoreError::from)
    }
}

enum ImportOutcome {
    Imported,
    Duplicate,
    Rejected(String),
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        id: row.try_get("id")?,
        position: row.try_get("position")?,
        group_id: row.try_get("group_id")?,
        sequence: row.try_get("sequence")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        category: row.try_get("category")?,
        payload: row.try_get("payload")?,
        occurred_at: row.try_get("occurred_at")?,
        replayed: row.try_get("replayed")?,
        acknowledged: row.try_get("acknowledged")?,
    })
}

#[async_trait]
impl EventStore for PostgresEventStore {
    fn local_facility(&self) -> &str {
        &self.facility_id
    }

    async fn append(&self, event: NewEvent) -> EventStoreResult<StoredEvent> {
        let event_id = event.id;
        let group_id = event.group_id.clone();
        let mut tx = self.pool.begin().await?;

        let stored = match self.append_in_tx(&mut tx, event).await {
            Ok(stored) => stored,
            Err(EventStoreError::DuplicateEvent(id)) => {
                // Same id committed by a writer outside the tail lock
                tx.rollback().await?;
                return fetch_by_id(&self.pool, id)
                    .await?
                    .ok_or(EventStoreError::EventNotFound(id));
            }
            Err(e) => return Err(e),
        };

        tx.commit()
            .await
            .map_err(|e| EventStoreError::from_append(e, event_id, group_id.as_deref()))?;
        Ok(stored)
    }

    async fn import_batch(&self, events: Vec<StoredEvent>) -> EventStoreResult<ImportReport> {
        let mut tx = self.pool.begin().await?;
        lock_log_tail(&mut *tx).await?;
        let mut report = ImportReport::default();
        let mut imported_groups: Vec<(Uuid, String, i64)> = Vec::new();

        for event in &events {
            match self.import_one(&mut tx, event).await? {
                ImportOutcome::Imported => {
                    report.imported.push(event.id);
                    if let Some(group_id) = &event.group_id {
                        imported_groups.push((event.id, group_id.clone(), event.sequence));
                    }
                }
                ImportOutcome::Duplicate => report.duplicates.push(event.id),
                ImportOutcome::Rejected(reason) => {
                    warn!(event_id = %event.id, reason = %reason, "Rejected peer event");
                    report.rejected.push(RejectedEvent {
                        id: event.id,
                        reason,
                    });
                }
            }
        }

        for (id, group_id, sequence) in imported_groups {
            let predecessors: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM events WHERE group_id = $1 AND sequence < $2",
            )
            .bind(&group_id)
            .bind(sequence)
            .fetch_one(&mut *tx)
            .await?;
            if predecessors != sequence - 1 {
                report.awaiting_predecessors.push(id);
            }
        }

        tx.commit().await?;

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
        Ok(fetch_by_id(&self.pool, event_id).await?)
    }

    async fn find_by_group(&self, group_id: &str) -> EventStoreResult<Vec<StoredEvent>> {
        self.fetch_events(
            r#"
            SELECT
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            FROM events
            WHERE group_id = $1
            ORDER BY sequence ASC
            "#,
            Some(group_id),
            None,
        )
        .await
    }

    async fn find_unreplayed_by_group_ordered(
        &self,
        group_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        self.fetch_events(
            r#"
            SELECT
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            FROM events
            WHERE group_id = $1 AND NOT replayed
            ORDER BY sequence ASC
            "#,
            Some(group_id),
            None,
        )
        .await
    }

    async fn last_replayed_sequence(&self, group_id: &str) -> EventStoreResult<i64> {
        let watermark: i64 = sqlx::query_scalar(
            r#"
            WITH numbered AS (
                SELECT sequence, replayed, ROW_NUMBER() OVER (ORDER BY sequence) AS rn
                FROM events
                WHERE group_id = $1
            )
            SELECT COALESCE(
                (SELECT MIN(rn) - 1 FROM numbered WHERE sequence <> rn OR NOT replayed),
                (SELECT COUNT(*) FROM numbered)
            )
            "#,
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(watermark)
    }

    async fn find_replay_candidates(&self, limit: i64) -> EventStoreResult<Vec<StoredEvent>> {
        self.fetch_events(
            r#"
            SELECT
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            FROM events
            WHERE NOT replayed
            ORDER BY position ASC
            LIMIT $1
            "#,
            None,
            Some(limit),
        )
        .await
    }

    async fn mark_replayed(&self, event_id: Uuid) -> EventStoreResult<()> {
        let result = sqlx::query("UPDATE events SET replayed = TRUE WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as replayed");
            return Err(EventStoreError::EventNotFound(event_id));
        }

        debug!(event_id = %event_id, "Event marked as replayed");
        Ok(())
    }

    async fn find_pending_for_receiver(
        &self,
        receiver_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        self.fetch_events(
            r#"
            SELECT
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            FROM events
            WHERE receiver_id = $1 AND NOT acknowledged
            ORDER BY position ASC
            "#,
            Some(receiver_id),
            None,
        )
        .await
    }

    async fn find_unacknowledged_sent_by(
        &self,
        sender_id: &str,
        limit: i64,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        self.fetch_events(
            r#"
            SELECT
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            FROM events
            WHERE sender_id = $1 AND NOT acknowledged
            ORDER BY position ASC
            LIMIT $2
            "#,
            Some(sender_id),
            Some(limit),
        )
        .await
    }

    async fn confirm_received_to_online_web(&self, event_ids: &[Uuid]) -> EventStoreResult<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE events SET acknowledged = TRUE WHERE id = ANY($1) AND NOT acknowledged",
        )
        .bind(event_ids)
        .execute(&self.pool)
        .await?;

        debug!(
            requested = event_ids.len(),
            acknowledged = result.rows_affected(),
            "Confirmed events received by peer"
        );

        Ok(result.rows_affected())
    }

    async fn export_since(&self, cursor: i64, limit: i64) -> EventStoreResult<ExportBatch> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            FROM events
            WHERE position > $1
            ORDER BY position ASC
            LIMIT $2
            "#,
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        let next_cursor = events.last().map_or(cursor, |e| e.position);

        Ok(ExportBatch {
            events,
            next_cursor,
        })
    }

    async fn count_since(&self, category: &str, after_position: i64) -> EventStoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE category = $1 AND position > $2")
                .bind(category)
                .bind(after_position)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn find_latest_matching(
        &self,
        category: &str,
        filter: &serde_json::Value,
    ) -> EventStoreResult<Option<StoredEvent>> {
        let row = sqlx::query(
            r#"
            SELECT
                id, position, group_id, sequence, sender_id, receiver_id,
                category, payload, occurred_at, replayed, acknowledged
            FROM events
            WHERE category = $1 AND payload @> $2
            ORDER BY position DESC
            LIMIT 1
            "#,
        )
        .bind(category)
        .bind(filter)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(event_from_row).transpose()?)
    }

    async fn latest_position(&self) -> EventStoreResult<i64> {
        let position: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(position)
    }

    async fn load_cursor(&self, peer_id: &str) -> EventStoreResult<i64> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM sync_cursors WHERE peer_id = $1")
                .bind(peer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(position.unwrap_or(0))
    }

    async fn save_cursor(&self, peer_id: &str, position: i64) -> EventStoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (peer_id, position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (peer_id)
            DO UPDATE SET
                position = GREATEST(sync_cursors.position, EXCLUDED.position),
                updated_at = NOW()
            "#,
        )
        .bind(peer_id)
        .bind(position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_stats(&self) -> EventStoreResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT replayed) AS pending,
                COUNT(*) FILTER (WHERE NOT acknowledged AND sender_id = $1) AS unacknowledged
            FROM events
            "#,
        )
        .bind(&self.facility_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("pending")?, row.try_get("unacknowledged")?))
    }
}
