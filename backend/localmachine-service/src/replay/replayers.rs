use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use event_store::StoredEvent;
use std::sync::Arc;
use tracing::debug;

use super::{ReplayOutcome, Replayer};
use crate::auth::{run_as, ActingUser};
use crate::events::{DomainEvent, EventCategory};
use crate::services::{
    BackupService, ConfirmPodRequest, FcIntegrationService, MasterDataService, PodService,
    ReplayServices, RequisitionService, RequisitionStatus, StockService,
};

/// One replayer per replayable category
pub fn all(services: &ReplayServices) -> Vec<Arc<dyn Replayer>> {
    vec![
        Arc::new(ReleasedWithoutOrderReplayer::new(services.requisitions.clone())),
        Arc::new(PodConfirmedAndroidReplayer::new(services.pods.clone())),
        Arc::new(FcIssueVoucherReplayer::new(services.fc.clone())),
        Arc::new(FcReceiptPlanReplayer::new(services.fc.clone())),
        Arc::new(LocalMovementReplayer::new(services.stock.clone())),
        Arc::new(MasterDataReplayer::new(services.master_data.clone())),
        Arc::new(BackupDatabaseReplayer::new(services.backups.clone())),
    ]
}

fn wrong_kind(expected: EventCategory, event: &DomainEvent) -> anyhow::Error {
    anyhow!(
        "{} replayer received a {} event",
        expected,
        event.category()
    )
}

/// Requisition released without order on another facility
pub struct ReleasedWithoutOrderReplayer {
    requisitions: Arc<dyn RequisitionService>,
}

impl ReleasedWithoutOrderReplayer {
    pub fn new(requisitions: Arc<dyn RequisitionService>) -> Self {
        Self { requisitions }
    }
}

#[async_trait]
impl Replayer for ReleasedWithoutOrderReplayer {
    fn category(&self) -> EventCategory {
        EventCategory::ReleasedWithoutOrder
    }

    async fn replay(&self, stored: &StoredEvent, event: &DomainEvent) -> Result<ReplayOutcome> {
        let DomainEvent::ReleasedWithoutOrder(release) = event else {
            return Err(wrong_kind(self.category(), event));
        };

        match self.requisitions.find_status(release.requisition_id).await? {
            None => bail!("requisition {} not found", release.requisition_id),
            Some(RequisitionStatus::ReleasedWithoutOrder) => {
                debug!(
                    event_id = %stored.id,
                    requisition_id = %release.requisition_id,
                    "Requisition already released without order"
                );
                return Ok(ReplayOutcome::AlreadyApplied);
            }
            Some(_) => {}
        }

        run_as(
            ActingUser::new(release.author_id),
            self.requisitions.release_without_order(release.requisition_id),
        )
        .await?;
        Ok(ReplayOutcome::Applied)
    }
}

/// Proof of delivery confirmed on an android device
pub struct PodConfirmedAndroidReplayer {
    pods: Arc<dyn PodService>,
}

impl PodConfirmedAndroidReplayer {
    pub fn new(pods: Arc<dyn PodService>) -> Self {
        Self { pods }
    }
}

#[async_trait]
impl Replayer for PodConfirmedAndroidReplayer {
    fn category(&self) -> EventCategory {
        EventCategory::PodConfirmedAndroid
    }

    async fn replay(&self, _stored: &StoredEvent, event: &DomainEvent) -> Result<ReplayOutcome> {
        let DomainEvent::PodConfirmedAndroid(pod) = event else {
            return Err(wrong_kind(self.category(), event));
        };

        if self.pods.is_confirmed(pod.pod_id).await? {
            return Ok(ReplayOutcome::AlreadyApplied);
        }

        let request = ConfirmPodRequest {
            pod_id: pod.pod_id,
            received_by: pod.received_by.clone(),
            received_date: pod.received_date,
        };
        run_as(
            ActingUser::new(pod.confirmed_by),
            self.pods.confirm_pod(request, true),
        )
        .await?;
        Ok(ReplayOutcome::Applied)
    }
}

pub struct FcIssueVoucherReplayer {
    fc: Arc<dyn FcIntegrationService>,
}

impl FcIssueVoucherReplayer {
    pub fn new(fc: Arc<dyn FcIntegrationService>) -> Self {
        Self { fc }
    }
}

#[async_trait]
impl Replayer for FcIssueVoucherReplayer {
    fn category(&self) -> EventCategory {
        EventCategory::FcIssueVoucher
    }

    async fn replay(&self, _stored: &StoredEvent, event: &DomainEvent) -> Result<ReplayOutcome> {
        let DomainEvent::FcIssueVoucher(voucher) = event else {
            return Err(wrong_kind(self.category(), event));
        };

        if self.fc.issue_voucher_exists(&voucher.issue_voucher_number).await? {
            return Ok(ReplayOutcome::AlreadyApplied);
        }

        run_as(
            ActingUser::new(voucher.author_id),
            self.fc.create_issue_voucher(voucher),
        )
        .await?;
        Ok(ReplayOutcome::Applied)
    }
}

pub struct FcReceiptPlanReplayer {
    fc: Arc<dyn FcIntegrationService>,
}

impl FcReceiptPlanReplayer {
    pub fn new(fc: Arc<dyn FcIntegrationService>) -> Self {
        Self { fc }
    }
}

#[async_trait]
impl Replayer for FcReceiptPlanReplayer {
    fn category(&self) -> EventCategory {
        EventCategory::FcReceiptPlan
    }

    async fn replay(&self, _stored: &StoredEvent, event: &DomainEvent) -> Result<ReplayOutcome> {
        let DomainEvent::FcReceiptPlan(plan) = event else {
            return Err(wrong_kind(self.category(), event));
        };

        if self.fc.receipt_plan_exists(&plan.receipt_plan_number).await? {
            return Ok(ReplayOutcome::AlreadyApplied);
        }

        run_as(ActingUser::new(plan.author_id), self.fc.create_receipt_plan(plan)).await?;
        Ok(ReplayOutcome::Applied)
    }
}

/// Stock movements captured on another facility
pub struct LocalMovementReplayer {
    stock: Arc<dyn StockService>,
}

impl LocalMovementReplayer {
    pub fn new(stock: Arc<dyn StockService>) -> Self {
        Self { stock }
    }
}

#[async_trait]
impl Replayer for LocalMovementReplayer {
    fn category(&self) -> EventCategory {
        EventCategory::LocalMovement
    }

    async fn replay(&self, _stored: &StoredEvent, event: &DomainEvent) -> Result<ReplayOutcome> {
        let DomainEvent::LocalMovement(movement) = event else {
            return Err(wrong_kind(self.category(), event));
        };

        if self.stock.is_movement_applied(movement.batch_id).await? {
            return Ok(ReplayOutcome::AlreadyApplied);
        }
        self.stock.apply_movement(movement).await?;
        Ok(ReplayOutcome::Applied)
    }
}

pub struct MasterDataReplayer {
    master_data: Arc<dyn MasterDataService>,
}

impl MasterDataReplayer {
    pub fn new(master_data: Arc<dyn MasterDataService>) -> Self {
        Self { master_data }
    }
}

#[async_trait]
impl Replayer for MasterDataReplayer {
    fn category(&self) -> EventCategory {
        EventCategory::MasterData
    }

    async fn replay(&self, _stored: &StoredEvent, event: &DomainEvent) -> Result<ReplayOutcome> {
        let DomainEvent::MasterData(master_data) = event else {
            return Err(wrong_kind(self.category(), event));
        };

        if self.master_data.is_batch_applied(master_data.batch_id).await? {
            return Ok(ReplayOutcome::AlreadyApplied);
        }
        self.master_data.apply(master_data).await?;
        Ok(ReplayOutcome::Applied)
    }
}

pub struct BackupDatabaseReplayer {
    backups: Arc<dyn BackupService>,
}

impl BackupDatabaseReplayer {
    pub fn new(backups: Arc<dyn BackupService>) -> Self {
        Self { backups }
    }
}

#[async_trait]
impl Replayer for BackupDatabaseReplayer {
    fn category(&self) -> EventCategory {
        EventCategory::BackupDatabase
    }

    async fn replay(&self, _stored: &StoredEvent, event: &DomainEvent) -> Result<ReplayOutcome> {
        let DomainEvent::BackupDatabase(backup) = event else {
            return Err(wrong_kind(self.category(), event));
        };

        if self.backups.is_batch_stored(backup.batch_id).await? {
            return Ok(ReplayOutcome::AlreadyApplied);
        }
        self.backups.store(backup).await?;
        Ok(ReplayOutcome::Applied)
    }
}
