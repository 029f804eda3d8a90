use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{ServiceError, ServiceResult};

/// Persistence of the replication stream resume position per slot
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn save_offset(&self, slot_name: &str, position: i64) -> ServiceResult<()>;

    async fn read_offset(&self, slot_name: &str) -> ServiceResult<Option<i64>>;

    /// Forget every stored position; the next capture starts from scratch
    async fn clear_all(&self) -> ServiceResult<u64>;
}

/// Stores CDC resume positions in PostgreSQL
///
/// Schema (see `migrations/002_create_cdc_state.sql`):
/// ```sql
/// CREATE TABLE cdc_offsets (
///     slot_name VARCHAR(255) PRIMARY KEY,
///     position BIGINT NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
#[derive(Clone)]
pub struct PgOffsetStore {
    pool: PgPool,
}

impl PgOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OffsetStore for PgOffsetStore {
    async fn save_offset(&self, slot_name: &str, position: i64) -> ServiceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cdc_offsets (slot_name, position, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (slot_name)
            DO UPDATE SET
                position = EXCLUDED.position,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(slot_name)
        .bind(position)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(slot = slot_name, position, "Failed to save CDC offset: {}", e);
            ServiceError::Database(e)
        })?;

        debug!(slot = slot_name, position, "Saved CDC offset");
        Ok(())
    }

    async fn read_offset(&self, slot_name: &str) -> ServiceResult<Option<i64>> {
        let position = sqlx::query_scalar::<_, i64>(
            "SELECT position FROM cdc_offsets WHERE slot_name = $1",
        )
        .bind(slot_name)
        .fetch_optional(&self.pool)
        .await?;

        match position {
            Some(position) => debug!(slot = slot_name, position, "Found saved CDC offset"),
            None => debug!(slot = slot_name, "No saved CDC offset"),
        }
        Ok(position)
    }

    async fn clear_all(&self) -> ServiceResult<u64> {
        let result = sqlx::query("DELETE FROM cdc_offsets")
            .execute(&self.pool)
            .await?;

        info!(removed = result.rows_affected(), "Cleared CDC offsets");
        Ok(result.rows_affected())
    }
}

/// Process-local offset store
#[derive(Default)]
pub struct InMemoryOffsetStore {
    offsets: Mutex<HashMap<String, i64>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn save_offset(&self, slot_name: &str, position: i64) -> ServiceResult<()> {
        self.offsets
            .lock()
            .await
            .insert(slot_name.to_string(), position);
        Ok(())
    }

    async fn read_offset(&self, slot_name: &str) -> ServiceResult<Option<i64>> {
        Ok(self.offsets.lock().await.get(slot_name).copied())
    }

    async fn clear_all(&self) -> ServiceResult<u64> {
        let mut offsets = self.offsets.lock().await;
        let removed = offsets.len() as u64;
        offsets.clear();
        Ok(removed)
    }
}
