//! Emission and replay of group events across two event logs.

mod common;

use chrono::NaiveDate;
use common::{Fakes, FlakyStore};
use event_store::{EventStore, InMemoryEventStore, StoredEvent};
use localmachine_service::events::{
    DomainEvent, EventCategory, FcIssueVoucherEvent, FcLineItem, OrderReleaseEvent,
    PodConfirmedEvent,
};
use localmachine_service::publisher::EventPublisher;
use localmachine_service::replay::{replayers, ReplayDispatcher, ReplayOutcome};
use localmachine_service::services::RequisitionStatus;
use resilience::RetryConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const WEB: &str = "WEB";
const FACILITY: &str = "F1";

fn release(requisition_id: Uuid, number: &str, author_id: Uuid) -> DomainEvent {
    DomainEvent::from(OrderReleaseEvent {
        requisition_id,
        requisition_number: number.to_string(),
        author_id,
    })
}

fn receiving_side(fakes: &Fakes) -> (Arc<InMemoryEventStore>, ReplayDispatcher<InMemoryEventStore>) {
    let store = Arc::new(InMemoryEventStore::new(FACILITY));
    let dispatcher = ReplayDispatcher::new(store.clone(), replayers::all(&fakes.services()));
    (store, dispatcher)
}

async fn emit_release(
    publisher: &EventPublisher<InMemoryEventStore>,
    group: &str,
    requisition_id: Uuid,
) -> StoredEvent {
    publisher
        .emit_group_event(
            group,
            FACILITY,
            &release(requisition_id, group, Uuid::new_v4()),
            EventCategory::ReleasedWithoutOrder,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_release_without_order_replays_once_under_author() {
    let fakes = Fakes::new();
    let requisition_id = Uuid::new_v4();
    let author_id = Uuid::new_v4();
    fakes
        .requisitions
        .insert(requisition_id, RequisitionStatus::Approved)
        .await;

    let web = EventPublisher::new(Arc::new(InMemoryEventStore::new(WEB)));
    let emitted = web
        .emit_group_event(
            "RN12344",
            FACILITY,
            &release(requisition_id, "RN12344", author_id),
            EventCategory::ReleasedWithoutOrder,
        )
        .await
        .unwrap();
    assert_eq!(emitted.sequence, 1);

    let (store, dispatcher) = receiving_side(&fakes);
    let report = store.import_batch(vec![emitted.clone()]).await.unwrap();
    assert_eq!(report.imported, vec![emitted.id]);

    let summary = dispatcher.replay_pending(100).await.unwrap();
    assert_eq!(summary.replayed, 1);
    assert_eq!(summary.failed, 0);

    assert_eq!(
        fakes.requisitions.status(requisition_id).await,
        Some(RequisitionStatus::ReleasedWithoutOrder)
    );
    let changes = fakes.requisitions.changes().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].author_id, Some(author_id));

    // Replaying the same event again finds the effect in place
    let stored = store.find_by_id(emitted.id).await.unwrap().unwrap();
    assert!(stored.replayed);
    let outcome = dispatcher.replay_event(&stored).await.unwrap();
    assert_eq!(outcome, ReplayOutcome::AlreadyApplied);
    assert_eq!(fakes.requisitions.changes().await.len(), 1);
    assert_eq!(store.last_replayed_sequence("RN12344").await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_emits_share_no_sequence() {
    let publisher = EventPublisher::new(Arc::new(InMemoryEventStore::new(WEB)));

    let (a, b) = tokio::join!(
        emit_release(&publisher, "RN1", Uuid::new_v4()),
        emit_release(&publisher, "RN1", Uuid::new_v4()),
    );

    let sequences: HashSet<i64> = [a.sequence, b.sequence].into_iter().collect();
    assert_eq!(sequences, HashSet::from([1, 2]));
}

#[tokio::test]
async fn test_lost_sequence_race_is_retried() {
    let store = Arc::new(FlakyStore::new(WEB, 2));
    let publisher = EventPublisher::new(store.clone());

    let stored = publisher
        .emit_group_event(
            "RN1",
            FACILITY,
            &release(Uuid::new_v4(), "RN1", Uuid::new_v4()),
            EventCategory::ReleasedWithoutOrder,
        )
        .await
        .unwrap();

    assert_eq!(stored.sequence, 1);
    assert_eq!(store.attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_persistent_conflict_surfaces_after_retries() {
    let store = Arc::new(FlakyStore::new(WEB, 10));
    let publisher = EventPublisher::new(store.clone()).with_retry(RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        backoff_multiplier: 2.0,
        jitter: false,
    });

    let err = publisher
        .emit_group_event(
            "RN1",
            FACILITY,
            &release(Uuid::new_v4(), "RN1", Uuid::new_v4()),
            EventCategory::ReleasedWithoutOrder,
        )
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_successor_waits_for_missing_predecessor() {
    let fakes = Fakes::new();
    let first_req = Uuid::new_v4();
    let second_req = Uuid::new_v4();
    fakes.requisitions.insert(first_req, RequisitionStatus::Approved).await;
    fakes.requisitions.insert(second_req, RequisitionStatus::Approved).await;

    let web = EventPublisher::new(Arc::new(InMemoryEventStore::new(WEB)));
    let first = emit_release(&web, "RN7", first_req).await;
    let second = emit_release(&web, "RN7", second_req).await;

    let (store, dispatcher) = receiving_side(&fakes);
    let report = store.import_batch(vec![second.clone()]).await.unwrap();
    assert_eq!(report.awaiting_predecessors, vec![second.id]);

    let summary = dispatcher.replay_pending(100).await.unwrap();
    assert_eq!(summary.replayed, 0);
    assert_eq!(summary.blocked_groups, vec!["RN7".to_string()]);
    assert!(fakes.requisitions.changes().await.is_empty());

    let report = store.import_batch(vec![first.clone()]).await.unwrap();
    assert!(report.awaiting_predecessors.is_empty());

    let summary = dispatcher.replay_pending(100).await.unwrap();
    assert_eq!(summary.replayed, 2);

    let order: Vec<Uuid> = fakes
        .requisitions
        .changes()
        .await
        .into_iter()
        .map(|c| c.requisition_id)
        .collect();
    assert_eq!(order, vec![first_req, second_req]);
    assert_eq!(store.last_replayed_sequence("RN7").await.unwrap(), 2);
}

#[tokio::test]
async fn test_interleaved_duplicates_apply_each_event_once() {
    let fakes = Fakes::new();
    let requisitions: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for id in &requisitions {
        fakes.requisitions.insert(*id, RequisitionStatus::Approved).await;
    }

    let web = EventPublisher::new(Arc::new(InMemoryEventStore::new(WEB)));
    let mut emitted = Vec::new();
    for id in &requisitions {
        emitted.push(emit_release(&web, "RN9", *id).await);
    }

    let (store, dispatcher) = receiving_side(&fakes);
    store.import_batch(emitted[..2].to_vec()).await.unwrap();
    dispatcher.replay_pending(100).await.unwrap();

    let report = store
        .import_batch(vec![
            emitted[1].clone(),
            emitted[0].clone(),
            emitted[2].clone(),
            emitted[1].clone(),
        ])
        .await
        .unwrap();
    assert_eq!(report.imported, vec![emitted[2].id]);
    assert_eq!(report.duplicates.len(), 3);
    dispatcher.replay_pending(100).await.unwrap();

    let changes = fakes.requisitions.changes().await;
    assert_eq!(changes.len(), 3);
    let order: Vec<Uuid> = changes.into_iter().map(|c| c.requisition_id).collect();
    assert_eq!(order, requisitions);
}

#[tokio::test]
async fn test_failed_replay_blocks_rest_of_group_until_fixed() {
    let fakes = Fakes::new();
    let missing = Uuid::new_v4();
    let present = Uuid::new_v4();
    fakes.requisitions.insert(present, RequisitionStatus::Approved).await;

    let web = EventPublisher::new(Arc::new(InMemoryEventStore::new(WEB)));
    let first = emit_release(&web, "RN3", missing).await;
    let second = emit_release(&web, "RN3", present).await;

    let (store, dispatcher) = receiving_side(&fakes);
    store.import_batch(vec![first, second]).await.unwrap();

    let summary = dispatcher.replay_pending(100).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.replayed, 0);
    assert!(fakes.requisitions.changes().await.is_empty());

    fakes.requisitions.insert(missing, RequisitionStatus::Approved).await;
    let summary = dispatcher.replay_pending(100).await.unwrap();
    assert_eq!(summary.replayed, 2);
    assert_eq!(store.last_replayed_sequence("RN3").await.unwrap(), 2);
}

#[tokio::test]
async fn test_pod_and_fc_replay_skip_existing_state() {
    let fakes = Fakes::new();
    let confirmed_by = Uuid::new_v4();
    let pod_id = Uuid::new_v4();

    let web = EventPublisher::new(Arc::new(InMemoryEventStore::new(WEB)));
    let pod = web
        .emit_group_event(
            "RN5",
            FACILITY,
            &DomainEvent::from(PodConfirmedEvent {
                pod_id,
                requisition_number: "RN5".to_string(),
                confirmed_by,
                received_by: "clerk".to_string(),
                received_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            }),
            EventCategory::PodConfirmedAndroid,
        )
        .await
        .unwrap();
    let voucher = web
        .emit_non_group(&DomainEvent::from(FcIssueVoucherEvent {
            issue_voucher_number: "IV-1".to_string(),
            requisition_number: "RN5".to_string(),
            supplying_depot_code: "D1".to_string(),
            author_id: Uuid::new_v4(),
            line_items: vec![FcLineItem {
                product_code: "08S01".to_string(),
                quantity: 12,
                lot_code: Some("L1".to_string()),
            }],
        }))
        .await
        .unwrap();

    let (store, dispatcher) = receiving_side(&fakes);
    store.import_batch(vec![pod.clone(), voucher.clone()]).await.unwrap();
    let summary = dispatcher.replay_pending(100).await.unwrap();
    assert_eq!(summary.replayed, 2);
    assert_eq!(fakes.pods.confirmed_by(pod_id).await, Some(confirmed_by));
    assert_eq!(*fakes.fc.vouchers.lock().await, vec!["IV-1".to_string()]);

    for event in [&pod, &voucher] {
        let outcome = dispatcher.replay_event(event).await.unwrap();
        assert_eq!(outcome, ReplayOutcome::AlreadyApplied);
    }
    assert_eq!(
        fakes.pods.confirmations.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(fakes.fc.vouchers.lock().await.len(), 1);
    assert_eq!(store.pending_stats().await.unwrap().0, 0);
}
