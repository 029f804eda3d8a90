use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ServiceResult;

/// The single liveness row
#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    /// Insert or refresh the row with `at`
    async fn beat(&self, at: DateTime<Utc>) -> ServiceResult<()>;

    async fn delete(&self) -> ServiceResult<()>;
}

#[derive(Clone)]
pub struct PgHeartbeatRepository {
    pool: PgPool,
}

impl PgHeartbeatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HeartbeatRepository for PgHeartbeatRepository {
    async fn beat(&self, at: DateTime<Utc>) -> ServiceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cdc_heart_beat (id, beat_at)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET beat_at = EXCLUDED.beat_at
            "#,
        )
        .bind(at)
        .execute(&self.pool)
        .await?;

        debug!(beat_at = %at, "Heartbeat written");
        Ok(())
    }

    async fn delete(&self) -> ServiceResult<()> {
        let result = sqlx::query("DELETE FROM cdc_heart_beat")
            .execute(&self.pool)
            .await?;

        info!(removed = result.rows_affected(), "Heartbeat row deleted");
        Ok(())
    }
}

/// Keeps the row in memory; for tests and dry runs
#[derive(Default)]
pub struct InMemoryHeartbeatRepository {
    row: Mutex<Option<DateTime<Utc>>>,
}

impl InMemoryHeartbeatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<DateTime<Utc>> {
        *self.row.lock().await
    }
}

#[async_trait]
impl HeartbeatRepository for InMemoryHeartbeatRepository {
    async fn beat(&self, at: DateTime<Utc>) -> ServiceResult<()> {
        *self.row.lock().await = Some(at);
        Ok(())
    }

    async fn delete(&self) -> ServiceResult<()> {
        *self.row.lock().await = None;
        Ok(())
    }
}
