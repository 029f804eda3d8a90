//! Business services invoked by replay.
//!
//! The sync engine only sees these interfaces. Every mutating call is
//! expected to run in its own transaction and to attribute changes to
//! [`crate::auth::current_user`]. PostgreSQL implementations live in
//! [`postgres`].

pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::cdc::CdcRecord;
use crate::events::{
    BackupDatabaseEvent, FcIssueVoucherEvent, FcReceiptPlanEvent, LocalMovementEvent,
    MasterDataEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequisitionStatus {
    Initiated,
    Submitted,
    Authorized,
    InApproval,
    Approved,
    ReleasedWithoutOrder,
    Released,
}

impl RequisitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequisitionStatus::Initiated => "INITIATED",
            RequisitionStatus::Submitted => "SUBMITTED",
            RequisitionStatus::Authorized => "AUTHORIZED",
            RequisitionStatus::InApproval => "IN_APPROVAL",
            RequisitionStatus::Approved => "APPROVED",
            RequisitionStatus::ReleasedWithoutOrder => "RELEASED_WITHOUT_ORDER",
            RequisitionStatus::Released => "RELEASED",
        }
    }
}

impl fmt::Display for RequisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequisitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RequisitionStatus::Initiated,
            RequisitionStatus::Submitted,
            RequisitionStatus::Authorized,
            RequisitionStatus::InApproval,
            RequisitionStatus::Approved,
            RequisitionStatus::ReleasedWithoutOrder,
            RequisitionStatus::Released,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| format!("unknown requisition status: {}", s))
    }
}

#[async_trait]
pub trait RequisitionService: Send + Sync {
    async fn find_status(&self, requisition_id: Uuid) -> Result<Option<RequisitionStatus>>;

    /// Move the requisition to RELEASED_WITHOUT_ORDER and record the status
    /// change under the acting user
    async fn release_without_order(&self, requisition_id: Uuid) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmPodRequest {
    pub pod_id: Uuid,
    pub received_by: String,
    pub received_date: NaiveDate,
}

#[async_trait]
pub trait PodService: Send + Sync {
    async fn is_confirmed(&self, pod_id: Uuid) -> Result<bool>;

    /// `is_replay` skips side effects that already happened on the origin
    /// device (notifications, outbound sync)
    async fn confirm_pod(&self, request: ConfirmPodRequest, is_replay: bool) -> Result<()>;
}

/// Central warehouse integration documents
#[async_trait]
pub trait FcIntegrationService: Send + Sync {
    async fn issue_voucher_exists(&self, issue_voucher_number: &str) -> Result<bool>;

    async fn create_issue_voucher(&self, voucher: &FcIssueVoucherEvent) -> Result<()>;

    async fn receipt_plan_exists(&self, receipt_plan_number: &str) -> Result<bool>;

    async fn create_receipt_plan(&self, plan: &FcReceiptPlanEvent) -> Result<()>;
}

#[async_trait]
pub trait StockService: Send + Sync {
    async fn is_movement_applied(&self, batch_id: Uuid) -> Result<bool>;

    async fn apply_movement(&self, movement: &LocalMovementEvent) -> Result<()>;
}

#[async_trait]
pub trait MasterDataService: Send + Sync {
    async fn is_batch_applied(&self, batch_id: Uuid) -> Result<bool>;

    async fn apply(&self, master_data: &MasterDataEvent) -> Result<()>;
}

#[async_trait]
pub trait BackupService: Send + Sync {
    async fn is_batch_stored(&self, batch_id: Uuid) -> Result<bool>;

    async fn store(&self, backup: &BackupDatabaseEvent) -> Result<()>;
}

/// Full dump of the master data tables, shaped like captured rows
#[async_trait]
pub trait MasterDataSource: Send + Sync {
    async fn snapshot_records(&self) -> Result<Vec<CdcRecord>>;
}

/// Everything replay needs, one handle per service
#[derive(Clone)]
pub struct ReplayServices {
    pub requisitions: Arc<dyn RequisitionService>,
    pub pods: Arc<dyn PodService>,
    pub fc: Arc<dyn FcIntegrationService>,
    pub stock: Arc<dyn StockService>,
    pub master_data: Arc<dyn MasterDataService>,
    pub backups: Arc<dyn BackupService>,
}
