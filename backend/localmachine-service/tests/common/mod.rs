//! Shared fixtures for the integration tests: in-memory business services
//! and an event store that loses the first group sequence races.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use event_store::{
    EventStore, EventStoreError, EventStoreResult, ExportBatch, ImportReport, InMemoryEventStore,
    NewEvent, StoredEvent,
};
use localmachine_service::auth::current_user;
use localmachine_service::events::{
    BackupDatabaseEvent, FcIssueVoucherEvent, FcReceiptPlanEvent, LocalMovementEvent,
    MasterDataEvent,
};
use localmachine_service::services::{
    BackupService, ConfirmPodRequest, FcIntegrationService, MasterDataService, PodService,
    ReplayServices, RequisitionService, RequisitionStatus, StockService,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub requisition_id: Uuid,
    pub status: RequisitionStatus,
    pub author_id: Option<Uuid>,
}

#[derive(Default)]
pub struct FakeRequisitions {
    statuses: Mutex<HashMap<Uuid, RequisitionStatus>>,
    changes: Mutex<Vec<StatusChange>>,
}

impl FakeRequisitions {
    pub async fn insert(&self, requisition_id: Uuid, status: RequisitionStatus) {
        self.statuses.lock().await.insert(requisition_id, status);
    }

    pub async fn status(&self, requisition_id: Uuid) -> Option<RequisitionStatus> {
        self.statuses.lock().await.get(&requisition_id).copied()
    }

    pub async fn changes(&self) -> Vec<StatusChange> {
        self.changes.lock().await.clone()
    }
}

#[async_trait]
impl RequisitionService for FakeRequisitions {
    async fn find_status(&self, requisition_id: Uuid) -> Result<Option<RequisitionStatus>> {
        Ok(self.status(requisition_id).await)
    }

    async fn release_without_order(&self, requisition_id: Uuid) -> Result<()> {
        let mut statuses = self.statuses.lock().await;
        let Some(status) = statuses.get_mut(&requisition_id) else {
            bail!("requisition {} not found", requisition_id);
        };
        *status = RequisitionStatus::ReleasedWithoutOrder;
        self.changes.lock().await.push(StatusChange {
            requisition_id,
            status: RequisitionStatus::ReleasedWithoutOrder,
            author_id: current_user().map(|user| user.user_id),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePods {
    confirmed: Mutex<HashMap<Uuid, (ConfirmPodRequest, Option<Uuid>)>>,
    pub confirmations: AtomicUsize,
}

impl FakePods {
    pub async fn confirmed_by(&self, pod_id: Uuid) -> Option<Uuid> {
        self.confirmed
            .lock()
            .await
            .get(&pod_id)
            .and_then(|(_, by)| *by)
    }
}

#[async_trait]
impl PodService for FakePods {
    async fn is_confirmed(&self, pod_id: Uuid) -> Result<bool> {
        Ok(self.confirmed.lock().await.contains_key(&pod_id))
    }

    async fn confirm_pod(&self, request: ConfirmPodRequest, is_replay: bool) -> Result<()> {
        if !is_replay {
            bail!("only replayed confirmations are expected here");
        }
        self.confirmations.fetch_add(1, Ordering::SeqCst);
        let by = current_user().map(|user| user.user_id);
        self.confirmed
            .lock()
            .await
            .insert(request.pod_id, (request, by));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFc {
    pub vouchers: Mutex<Vec<String>>,
    pub plans: Mutex<Vec<String>>,
}

#[async_trait]
impl FcIntegrationService for FakeFc {
    async fn issue_voucher_exists(&self, issue_voucher_number: &str) -> Result<bool> {
        Ok(self
            .vouchers
            .lock()
            .await
            .iter()
            .any(|n| n == issue_voucher_number))
    }

    async fn create_issue_voucher(&self, voucher: &FcIssueVoucherEvent) -> Result<()> {
        self.vouchers
            .lock()
            .await
            .push(voucher.issue_voucher_number.clone());
        Ok(())
    }

    async fn receipt_plan_exists(&self, receipt_plan_number: &str) -> Result<bool> {
        Ok(self
            .plans
            .lock()
            .await
            .iter()
            .any(|n| n == receipt_plan_number))
    }

    async fn create_receipt_plan(&self, plan: &FcReceiptPlanEvent) -> Result<()> {
        self.plans.lock().await.push(plan.receipt_plan_number.clone());
        Ok(())
    }
}

/// Stock, master data and backup sink keyed by batch id
#[derive(Default)]
pub struct FakeReplica {
    pub movements: Mutex<Vec<LocalMovementEvent>>,
    pub master_data: Mutex<Vec<MasterDataEvent>>,
    pub backups: Mutex<Vec<BackupDatabaseEvent>>,
    applied: Mutex<HashSet<Uuid>>,
}

#[async_trait]
impl StockService for FakeReplica {
    async fn is_movement_applied(&self, batch_id: Uuid) -> Result<bool> {
        Ok(self.applied.lock().await.contains(&batch_id))
    }

    async fn apply_movement(&self, movement: &LocalMovementEvent) -> Result<()> {
        self.applied.lock().await.insert(movement.batch_id);
        self.movements.lock().await.push(movement.clone());
        Ok(())
    }
}

#[async_trait]
impl MasterDataService for FakeReplica {
    async fn is_batch_applied(&self, batch_id: Uuid) -> Result<bool> {
        Ok(self.applied.lock().await.contains(&batch_id))
    }

    async fn apply(&self, master_data: &MasterDataEvent) -> Result<()> {
        self.applied.lock().await.insert(master_data.batch_id);
        self.master_data.lock().await.push(master_data.clone());
        Ok(())
    }
}

#[async_trait]
impl BackupService for FakeReplica {
    async fn is_batch_stored(&self, batch_id: Uuid) -> Result<bool> {
        Ok(self
            .backups
            .lock()
            .await
            .iter()
            .any(|b| b.batch_id == batch_id))
    }

    async fn store(&self, backup: &BackupDatabaseEvent) -> Result<()> {
        self.backups.lock().await.push(backup.clone());
        Ok(())
    }
}

pub struct Fakes {
    pub requisitions: Arc<FakeRequisitions>,
    pub pods: Arc<FakePods>,
    pub fc: Arc<FakeFc>,
    pub replica: Arc<FakeReplica>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            requisitions: Arc::new(FakeRequisitions::default()),
            pods: Arc::new(FakePods::default()),
            fc: Arc::new(FakeFc::default()),
            replica: Arc::new(FakeReplica::default()),
        }
    }

    pub fn services(&self) -> ReplayServices {
        ReplayServices {
            requisitions: self.requisitions.clone(),
            pods: self.pods.clone(),
            fc: self.fc.clone(),
            stock: self.replica.clone(),
            master_data: self.replica.clone(),
            backups: self.replica.clone(),
        }
    }
}

/// In-memory store whose first `conflicts` group appends lose the sequence race
pub struct FlakyStore {
    inner: InMemoryEventStore,
    conflicts: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new(facility_id: &str, conflicts: usize) -> Self {
        Self {
            inner: InMemoryEventStore::new(facility_id),
            conflicts: AtomicUsize::new(conflicts),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    fn local_facility(&self) -> &str {
        self.inner.local_facility()
    }

    async fn append(&self, event: NewEvent) -> EventStoreResult<StoredEvent> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(group_id) = &event.group_id {
            let lose = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if lose {
                return Err(EventStoreError::ConcurrentAppendConflict {
                    group_id: group_id.clone(),
                });
            }
        }
        self.inner.append(event).await
    }

    async fn import_batch(&self, events: Vec<StoredEvent>) -> EventStoreResult<ImportReport> {
        self.inner.import_batch(events).await
    }

    async fn find_by_id(&self, event_id: Uuid) -> EventStoreResult<Option<StoredEvent>> {
        self.inner.find_by_id(event_id).await
    }

    async fn find_by_group(&self, group_id: &str) -> EventStoreResult<Vec<StoredEvent>> {
        self.inner.find_by_group(group_id).await
    }

    async fn find_unreplayed_by_group_ordered(
        &self,
        group_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        self.inner.find_unreplayed_by_group_ordered(group_id).await
    }

    async fn last_replayed_sequence(&self, group_id: &str) -> EventStoreResult<i64> {
        self.inner.last_replayed_sequence(group_id).await
    }

    async fn find_replay_candidates(&self, limit: i64) -> EventStoreResult<Vec<StoredEvent>> {
        self.inner.find_replay_candidates(limit).await
    }

    async fn mark_replayed(&self, event_id: Uuid) -> EventStoreResult<()> {
        self.inner.mark_replayed(event_id).await
    }

    async fn find_pending_for_receiver(
        &self,
        receiver_id: &str,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        self.inner.find_pending_for_receiver(receiver_id).await
    }

    async fn find_unacknowledged_sent_by(
        &self,
        sender_id: &str,
        limit: i64,
    ) -> EventStoreResult<Vec<StoredEvent>> {
        self.inner.find_unacknowledged_sent_by(sender_id, limit).await
    }

    async fn confirm_received_to_online_web(&self, event_ids: &[Uuid]) -> EventStoreResult<u64> {
        self.inner.confirm_received_to_online_web(event_ids).await
    }

    async fn export_since(&self, cursor: i64, limit: i64) -> EventStoreResult<ExportBatch> {
        self.inner.export_since(cursor, limit).await
    }

    async fn count_since(&self, category: &str, after_position: i64) -> EventStoreResult<i64> {
        self.inner.count_since(category, after_position).await
    }

    async fn find_latest_matching(
        &self,
        category: &str,
        filter: &serde_json::Value,
    ) -> EventStoreResult<Option<StoredEvent>> {
        self.inner.find_latest_matching(category, filter).await
    }

    async fn latest_position(&self) -> EventStoreResult<i64> {
        self.inner.latest_position().await
    }

    async fn load_cursor(&self, peer_id: &str) -> EventStoreResult<i64> {
        self.inner.load_cursor(peer_id).await
    }

    async fn save_cursor(&self, peer_id: &str, position: i64) -> EventStoreResult<()> {
        self.inner.save_cursor(peer_id, position).await
    }

    async fn pending_stats(&self) -> EventStoreResult<(i64, i64)> {
        self.inner.pending_stats().await
    }
}
