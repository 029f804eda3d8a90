use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cdc::{quote_ident, OffsetStore};
use crate::error::ServiceResult;

/// Teardown of the change capture state
#[async_trait]
pub trait CdcRecovery: Send + Sync {
    /// Drop the replication slot and the publication
    async fn drop_replication(&self) -> ServiceResult<()>;

    /// Forget every saved stream position
    async fn clear_offsets(&self) -> ServiceResult<u64>;
}

/// Ends the process after a fatal liveness breach
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, reason: &str);
}

pub struct PgCdcRecovery {
    pool: PgPool,
    offsets: Arc<dyn OffsetStore>,
    slot_name: String,
    publication_name: String,
}

impl PgCdcRecovery {
    pub fn new(
        pool: PgPool,
        offsets: Arc<dyn OffsetStore>,
        slot_name: impl Into<String>,
        publication_name: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            offsets,
            slot_name: slot_name.into(),
            publication_name: publication_name.into(),
        }
    }
}

#[async_trait]
impl CdcRecovery for PgCdcRecovery {
    async fn drop_replication(&self) -> ServiceResult<()> {
        // An active slot cannot be dropped; stop its walsender first
        sqlx::query(
            r#"
            SELECT pg_terminate_backend(active_pid)
            FROM pg_replication_slots
            WHERE slot_name = $1 AND active_pid IS NOT NULL
            "#,
        )
        .bind(&self.slot_name)
        .execute(&self.pool)
        .await?;

        let dropped = sqlx::query(
            r#"
            SELECT pg_drop_replication_slot(slot_name)
            FROM pg_replication_slots
            WHERE slot_name = $1
            "#,
        )
        .bind(&self.slot_name)
        .execute(&self.pool)
        .await?;

        if dropped.rows_affected() == 0 {
            warn!(slot = %self.slot_name, "Replication slot did not exist");
        }

        let drop_publication = format!(
            "DROP PUBLICATION IF EXISTS {}",
            quote_ident(&self.publication_name)
        );
        sqlx::query(&drop_publication).execute(&self.pool).await?;

        info!(
            slot = %self.slot_name,
            publication = %self.publication_name,
            "Replication slot and publication dropped"
        );
        Ok(())
    }

    async fn clear_offsets(&self) -> ServiceResult<u64> {
        self.offsets.clear_all().await
    }
}

/// Exits the process with a non-zero status so the supervisor restarts it
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitTerminator;

impl ProcessTerminator for ExitTerminator {
    fn terminate(&self, reason: &str) {
        error!(reason = %reason, "Terminating process after CDC liveness failure");
        std::process::exit(1);
    }
}
