use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ServiceResult;

/// A local machine known to the online web
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMachinePeer {
    pub facility_id: String,
    pub machine_id: Uuid,
    pub activated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Outcome of [`PeerRegistry::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub peer: LocalMachinePeer,
    /// `false` when the facility was already registered
    pub created: bool,
}

#[async_trait]
pub trait PeerRegistry: Send + Sync {
    async fn find(&self, facility_id: &str) -> ServiceResult<Option<LocalMachinePeer>>;

    /// Register a facility, or refresh the machine id of an existing one.
    /// The original activation time is kept.
    async fn register(
        &self,
        facility_id: &str,
        machine_id: Uuid,
        at: DateTime<Utc>,
    ) -> ServiceResult<Registration>;

    async fn touch(&self, facility_id: &str, at: DateTime<Utc>) -> ServiceResult<()>;
}

#[derive(Clone)]
pub struct PgPeerRegistry {
    pool: PgPool,
}

impl PgPeerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn peer_from_row(row: &sqlx::postgres::PgRow) -> Result<LocalMachinePeer, sqlx::Error> {
    Ok(LocalMachinePeer {
        facility_id: row.try_get("facility_id")?,
        machine_id: row.try_get("machine_id")?,
        activated_at: row.try_get("activated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

#[async_trait]
impl PeerRegistry for PgPeerRegistry {
    async fn find(&self, facility_id: &str) -> ServiceResult<Option<LocalMachinePeer>> {
        let row = sqlx::query(
            r#"
            SELECT facility_id, machine_id, activated_at, last_seen_at
            FROM local_machine_peers
            WHERE facility_id = $1
            "#,
        )
        .bind(facility_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(peer_from_row).transpose()?)
    }

    async fn register(
        &self,
        facility_id: &str,
        machine_id: Uuid,
        at: DateTime<Utc>,
    ) -> ServiceResult<Registration> {
        // xmax = 0 only for a freshly inserted row
        let row = sqlx::query(
            r#"
            INSERT INTO local_machine_peers (facility_id, machine_id, activated_at, last_seen_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (facility_id) DO UPDATE SET
                machine_id = EXCLUDED.machine_id,
                last_seen_at = EXCLUDED.last_seen_at
            RETURNING facility_id, machine_id, activated_at, last_seen_at,
                      (xmax = 0) AS created
            "#,
        )
        .bind(facility_id)
        .bind(machine_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Registration {
            peer: peer_from_row(&row)?,
            created: row.try_get("created")?,
        })
    }

    async fn touch(&self, facility_id: &str, at: DateTime<Utc>) -> ServiceResult<()> {
        sqlx::query("UPDATE local_machine_peers SET last_seen_at = $2 WHERE facility_id = $1")
            .bind(facility_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPeerRegistry {
    peers: Mutex<HashMap<String, LocalMachinePeer>>,
}

impl InMemoryPeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerRegistry for InMemoryPeerRegistry {
    async fn find(&self, facility_id: &str) -> ServiceResult<Option<LocalMachinePeer>> {
        Ok(self.peers.lock().await.get(facility_id).cloned())
    }

    async fn register(
        &self,
        facility_id: &str,
        machine_id: Uuid,
        at: DateTime<Utc>,
    ) -> ServiceResult<Registration> {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(facility_id) {
            Some(peer) => {
                peer.machine_id = machine_id;
                peer.last_seen_at = at;
                Ok(Registration {
                    peer: peer.clone(),
                    created: false,
                })
            }
            None => {
                let peer = LocalMachinePeer {
                    facility_id: facility_id.to_string(),
                    machine_id,
                    activated_at: at,
                    last_seen_at: at,
                };
                peers.insert(facility_id.to_string(), peer.clone());
                Ok(Registration {
                    peer,
                    created: true,
                })
            }
        }
    }

    async fn touch(&self, facility_id: &str, at: DateTime<Utc>) -> ServiceResult<()> {
        if let Some(peer) = self.peers.lock().await.get_mut(facility_id) {
            peer.last_seen_at = at;
        }
        Ok(())
    }
}
