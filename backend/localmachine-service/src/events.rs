//! Domain events exchanged between facilities.
//!
//! [`DomainEvent`] is the closed set of replayable event kinds. Its category
//! tag is what the log stores in `events.category`; the variant payload is
//! stored as JSON (object keys sorted, so re-serialization is byte-stable).

use chrono::NaiveDate;
use event_store::StoredEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::cdc::TableChangeEvent;
use crate::error::{ServiceError, ServiceResult};

/// Stable category tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    BackupDatabase,
    FcIssueVoucher,
    FcReceiptPlan,
    PodConfirmedAndroid,
    ReleasedWithoutOrder,
    LocalMovement,
    MasterData,
    /// Liveness signal of the capture pipeline; travels through the
    /// `cdc_heart_beat` table, never through the event log
    HeartBeat,
}

impl EventCategory {
    pub const ALL: [EventCategory; 8] = [
        EventCategory::BackupDatabase,
        EventCategory::FcIssueVoucher,
        EventCategory::FcReceiptPlan,
        EventCategory::PodConfirmedAndroid,
        EventCategory::ReleasedWithoutOrder,
        EventCategory::LocalMovement,
        EventCategory::MasterData,
        EventCategory::HeartBeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::BackupDatabase => "BACKUP_DATABASE",
            EventCategory::FcIssueVoucher => "FC_ISSUE_VOUCHER",
            EventCategory::FcReceiptPlan => "FC_RECEIPT_PLAN",
            EventCategory::PodConfirmedAndroid => "POD_CONFIRMED_ANDROID",
            EventCategory::ReleasedWithoutOrder => "RELEASED_WITHOUT_ORDER",
            EventCategory::LocalMovement => "LOCAL_MOVEMENT",
            EventCategory::MasterData => "MASTER_DATA",
            EventCategory::HeartBeat => "HEART_BEAT",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ServiceError::UnknownCategory(s.to_string()))
    }
}

/// A requisition released without an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReleaseEvent {
    pub requisition_id: Uuid,
    pub requisition_number: String,
    pub author_id: Uuid,
}

/// Proof of delivery confirmed on an android device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodConfirmedEvent {
    pub pod_id: Uuid,
    pub requisition_number: String,
    pub confirmed_by: Uuid,
    pub received_by: String,
    pub received_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcLineItem {
    pub product_code: String,
    pub quantity: i64,
    pub lot_code: Option<String>,
}

/// Issue voucher received from the central warehouse system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcIssueVoucherEvent {
    pub issue_voucher_number: String,
    pub requisition_number: String,
    pub supplying_depot_code: String,
    pub author_id: Uuid,
    pub line_items: Vec<FcLineItem>,
}

/// Receipt plan received from the central warehouse system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcReceiptPlanEvent {
    pub receipt_plan_number: String,
    pub requisition_number: String,
    pub author_id: Uuid,
    pub line_items: Vec<FcLineItem>,
}

/// Stock movement rows captured on one facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMovementEvent {
    /// Idempotency key of the captured batch
    pub batch_id: Uuid,
    pub facility_id: String,
    pub table_changes: Vec<TableChangeEvent>,
}

/// Rows mirrored to the online web as a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDatabaseEvent {
    pub batch_id: Uuid,
    pub facility_id: String,
    pub table_changes: Vec<TableChangeEvent>,
}

/// Reference data rows shared with every facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataEvent {
    pub batch_id: Uuid,
    pub facility_id: String,
    /// Full export rather than incremental change
    pub snapshot: bool,
    pub table_changes: Vec<TableChangeEvent>,
}

/// Replayable event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    ReleasedWithoutOrder(OrderReleaseEvent),
    PodConfirmedAndroid(PodConfirmedEvent),
    FcIssueVoucher(FcIssueVoucherEvent),
    FcReceiptPlan(FcReceiptPlanEvent),
    LocalMovement(LocalMovementEvent),
    MasterData(MasterDataEvent),
    BackupDatabase(BackupDatabaseEvent),
}

impl DomainEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            DomainEvent::ReleasedWithoutOrder(_) => EventCategory::ReleasedWithoutOrder,
            DomainEvent::PodConfirmedAndroid(_) => EventCategory::PodConfirmedAndroid,
            DomainEvent::FcIssueVoucher(_) => EventCategory::FcIssueVoucher,
            DomainEvent::FcReceiptPlan(_) => EventCategory::FcReceiptPlan,
            DomainEvent::LocalMovement(_) => EventCategory::LocalMovement,
            DomainEvent::MasterData(_) => EventCategory::MasterData,
            DomainEvent::BackupDatabase(_) => EventCategory::BackupDatabase,
        }
    }

    pub fn to_payload(&self) -> ServiceResult<serde_json::Value> {
        let value = match self {
            DomainEvent::ReleasedWithoutOrder(e) => serde_json::to_value(e),
            DomainEvent::PodConfirmedAndroid(e) => serde_json::to_value(e),
            DomainEvent::FcIssueVoucher(e) => serde_json::to_value(e),
            DomainEvent::FcReceiptPlan(e) => serde_json::to_value(e),
            DomainEvent::LocalMovement(e) => serde_json::to_value(e),
            DomainEvent::MasterData(e) => serde_json::to_value(e),
            DomainEvent::BackupDatabase(e) => serde_json::to_value(e),
        }?;
        Ok(value)
    }

    /// Decode the payload of a stored event according to its category tag
    pub fn decode(category: &str, payload: &serde_json::Value) -> ServiceResult<Self> {
        let payload = payload.clone();
        let event = match category.parse::<EventCategory>()? {
            EventCategory::ReleasedWithoutOrder => {
                DomainEvent::ReleasedWithoutOrder(serde_json::from_value(payload)?)
            }
            EventCategory::PodConfirmedAndroid => {
                DomainEvent::PodConfirmedAndroid(serde_json::from_value(payload)?)
            }
            EventCategory::FcIssueVoucher => {
                DomainEvent::FcIssueVoucher(serde_json::from_value(payload)?)
            }
            EventCategory::FcReceiptPlan => {
                DomainEvent::FcReceiptPlan(serde_json::from_value(payload)?)
            }
            EventCategory::LocalMovement => {
                DomainEvent::LocalMovement(serde_json::from_value(payload)?)
            }
            EventCategory::MasterData => DomainEvent::MasterData(serde_json::from_value(payload)?),
            EventCategory::BackupDatabase => {
                DomainEvent::BackupDatabase(serde_json::from_value(payload)?)
            }
            EventCategory::HeartBeat => {
                return Err(ServiceError::UnknownCategory(category.to_string()))
            }
        };
        Ok(event)
    }
}

impl TryFrom<&StoredEvent> for DomainEvent {
    type Error = ServiceError;

    fn try_from(event: &StoredEvent) -> Result<Self, Self::Error> {
        DomainEvent::decode(&event.category, &event.payload)
    }
}

macro_rules! impl_from_payload {
    ($($payload:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$payload> for DomainEvent {
                fn from(event: $payload) -> Self {
                    DomainEvent::$variant(event)
                }
            }
        )+
    };
}

impl_from_payload! {
    OrderReleaseEvent => ReleasedWithoutOrder,
    PodConfirmedEvent => PodConfirmedAndroid,
    FcIssueVoucherEvent => FcIssueVoucher,
    FcReceiptPlanEvent => FcReceiptPlan,
    LocalMovementEvent => LocalMovement,
    MasterDataEvent => MasterData,
    BackupDatabaseEvent => BackupDatabase,
}

/// Business key of the entity an event touches, for logs
pub fn entity_key(event: &DomainEvent) -> String {
    match event {
        DomainEvent::ReleasedWithoutOrder(e) => e.requisition_number.clone(),
        DomainEvent::PodConfirmedAndroid(e) => e.pod_id.to_string(),
        DomainEvent::FcIssueVoucher(e) => e.issue_voucher_number.clone(),
        DomainEvent::FcReceiptPlan(e) => e.receipt_plan_number.clone(),
        DomainEvent::LocalMovement(e) => e.batch_id.to_string(),
        DomainEvent::MasterData(e) => e.batch_id.to_string(),
        DomainEvent::BackupDatabase(e) => e.batch_id.to_string(),
    }
}
