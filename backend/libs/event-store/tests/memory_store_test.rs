//! Behavioural tests for the in-memory event log.
//!
//! The same rules hold for the PostgreSQL store; see `postgres_store_test.rs`.

use chrono::Utc;
use event_store::{EventStore, InMemoryEventStore, NewEvent, StoredEvent};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn peer_event(group: Option<&str>, sequence: i64, sender: &str, receiver: Option<&str>) -> StoredEvent {
    StoredEvent {
        id: Uuid::new_v4(),
        position: 0,
        group_id: group.map(str::to_string),
        sequence,
        sender_id: sender.to_string(),
        receiver_id: receiver.map(str::to_string),
        category: "RELEASED_WITHOUT_ORDER".to_string(),
        payload: serde_json::json!({ "sequence": sequence }),
        occurred_at: Utc::now(),
        replayed: false,
        acknowledged: false,
    }
}

#[tokio::test]
async fn test_concurrent_appends_get_unique_contiguous_sequences() {
    let store = Arc::new(InMemoryEventStore::new("F1"));

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append(
                        NewEvent::new("F1", "RELEASED_WITHOUT_ORDER", serde_json::json!({ "i": i }))
                            .with_group("RN1"),
                    )
                    .await
                    .expect("append should succeed")
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let sequences: HashSet<i64> = results
        .into_iter()
        .map(|r| r.expect("task panicked").sequence)
        .collect();

    assert_eq!(sequences.len(), 50);
    assert_eq!(sequences, (1..=50).collect::<HashSet<i64>>());
}

#[tokio::test]
async fn test_groups_are_sequenced_independently() {
    let store = InMemoryEventStore::new("F1");

    let a1 = store
        .append(NewEvent::new("F1", "X", serde_json::json!({})).with_group("A"))
        .await
        .unwrap();
    let b1 = store
        .append(NewEvent::new("F1", "X", serde_json::json!({})).with_group("B"))
        .await
        .unwrap();
    let a2 = store
        .append(NewEvent::new("F1", "X", serde_json::json!({})).with_group("A"))
        .await
        .unwrap();
    let loose = store
        .append(NewEvent::new("F1", "X", serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!((a1.sequence, b1.sequence, a2.sequence), (1, 1, 2));
    assert_eq!(loose.sequence, loose.position);
    assert!(loose.position > a2.position);
}

#[tokio::test]
async fn test_own_undirected_event_needs_no_local_replay() {
    let store = InMemoryEventStore::new("F1");

    let own = store
        .append(NewEvent::new("F1", "LOCAL_MOVEMENT", serde_json::json!({})))
        .await
        .unwrap();
    let to_self = store
        .append(NewEvent::new("F1", "X", serde_json::json!({})).with_receiver("F1"))
        .await
        .unwrap();

    assert!(own.replayed);
    assert!(!to_self.replayed);
    assert_eq!(store.find_replay_candidates(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_append_returns_stored_event() {
    let store = InMemoryEventStore::new("F1");
    let event = NewEvent::new("F1", "RELEASED_WITHOUT_ORDER", serde_json::json!({})).with_group("RN1");

    let first = store.append(event.clone()).await.unwrap();
    let second = store.append(event).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.position, first.position);
    assert_eq!(second.sequence, 1);
    assert_eq!(store.all_events().await.len(), 1);

    let next = store
        .append(NewEvent::new("F1", "RELEASED_WITHOUT_ORDER", serde_json::json!({})).with_group("RN1"))
        .await
        .unwrap();
    assert_eq!(next.sequence, 2);
}

#[tokio::test]
async fn test_duplicate_import_is_idempotent() {
    let store = InMemoryEventStore::new("F2");
    let event = peer_event(Some("RN12344"), 1, "F1", Some("F2"));

    let first = store.import_batch(vec![event.clone()]).await.unwrap();
    let second = store.import_batch(vec![event.clone()]).await.unwrap();

    assert_eq!(first.imported, vec![event.id]);
    assert!(second.imported.is_empty());
    assert_eq!(second.duplicates, vec![event.id]);
    assert_eq!(second.received_ids(), vec![event.id]);
    assert_eq!(store.all_events().await.len(), 1);
}

#[tokio::test]
async fn test_sequence_collision_is_rejected() {
    let store = InMemoryEventStore::new("F2");
    let original = peer_event(Some("RN1"), 1, "F1", Some("F2"));
    let impostor = peer_event(Some("RN1"), 1, "F3", Some("F2"));

    store.import_batch(vec![original.clone()]).await.unwrap();
    let report = store.import_batch(vec![impostor.clone()]).await.unwrap();

    assert!(report.imported.is_empty());
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, impostor.id);
    assert!(report.received_ids().is_empty());
}

#[tokio::test]
async fn test_out_of_order_import_waits_for_predecessor() {
    let store = InMemoryEventStore::new("F2");
    let first = peer_event(Some("RN1"), 1, "F1", Some("F2"));
    let second = peer_event(Some("RN1"), 2, "F1", Some("F2"));

    let report = store.import_batch(vec![second.clone()]).await.unwrap();
    assert_eq!(report.awaiting_predecessors, vec![second.id]);
    assert_eq!(store.last_replayed_sequence("RN1").await.unwrap(), 0);

    let report = store.import_batch(vec![first.clone()]).await.unwrap();
    assert!(report.awaiting_predecessors.is_empty());

    let ordered = store.find_unreplayed_by_group_ordered("RN1").await.unwrap();
    let ids: Vec<Uuid> = ordered.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[tokio::test]
async fn test_import_advances_local_group_counter() {
    let store = InMemoryEventStore::new("F2");
    store
        .import_batch(vec![
            peer_event(Some("RN1"), 1, "F1", None),
            peer_event(Some("RN1"), 2, "F1", None),
        ])
        .await
        .unwrap();

    let next = store
        .append(NewEvent::new("F2", "X", serde_json::json!({})).with_group("RN1"))
        .await
        .unwrap();

    assert_eq!(next.sequence, 3);
}

#[tokio::test]
async fn test_watermark_is_contiguous_replayed_prefix() {
    let store = InMemoryEventStore::new("F2");
    let e1 = peer_event(Some("RN1"), 1, "F1", Some("F2"));
    let e2 = peer_event(Some("RN1"), 2, "F1", Some("F2"));
    let e3 = peer_event(Some("RN1"), 3, "F1", Some("F2"));
    store
        .import_batch(vec![e1.clone(), e2.clone(), e3.clone()])
        .await
        .unwrap();

    store.mark_replayed(e1.id).await.unwrap();
    store.mark_replayed(e3.id).await.unwrap();
    assert_eq!(store.last_replayed_sequence("RN1").await.unwrap(), 1);

    store.mark_replayed(e2.id).await.unwrap();
    assert_eq!(store.last_replayed_sequence("RN1").await.unwrap(), 3);
    assert_eq!(store.last_replayed_sequence("unknown").await.unwrap(), 0);
}

#[tokio::test]
async fn test_event_for_other_receiver_counts_as_replayed_here() {
    let store = InMemoryEventStore::new("WEB");
    let e1 = peer_event(Some("RN1"), 1, "F1", Some("F2"));
    let e2 = peer_event(Some("RN1"), 2, "F2", Some("WEB"));
    store.import_batch(vec![e1, e2.clone()]).await.unwrap();

    assert_eq!(store.last_replayed_sequence("RN1").await.unwrap(), 1);
    let pending = store.find_unreplayed_by_group_ordered("RN1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, e2.id);
}

#[tokio::test]
async fn test_acknowledgement_empties_push_backlog() {
    let store = InMemoryEventStore::new("F1");
    let a = store
        .append(NewEvent::new("F1", "X", serde_json::json!({})))
        .await
        .unwrap();
    let b = store
        .append(NewEvent::new("F1", "X", serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(store.find_unacknowledged_sent_by("F1", 100).await.unwrap().len(), 2);

    let changed = store
        .confirm_received_to_online_web(&[a.id, b.id, Uuid::new_v4()])
        .await
        .unwrap();
    assert_eq!(changed, 2);
    assert!(store.find_unacknowledged_sent_by("F1", 100).await.unwrap().is_empty());

    let again = store.confirm_received_to_online_web(&[a.id]).await.unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_export_pages_by_cursor() {
    let store = InMemoryEventStore::new("WEB");
    for _ in 0..5 {
        store
            .append(NewEvent::new("WEB", "MASTER_DATA", serde_json::json!({})))
            .await
            .unwrap();
    }

    let first = store.export_since(0, 3).await.unwrap();
    assert_eq!(first.events.len(), 3);
    assert_eq!(first.next_cursor, 3);

    let second = store.export_since(first.next_cursor, 3).await.unwrap();
    assert_eq!(second.events.len(), 2);
    assert_eq!(second.next_cursor, 5);

    let empty = store.export_since(second.next_cursor, 3).await.unwrap();
    assert!(empty.events.is_empty());
    assert_eq!(empty.next_cursor, 5);

    assert_eq!(store.count_since("MASTER_DATA", 2).await.unwrap(), 3);
    assert_eq!(store.latest_position().await.unwrap(), 5);
}

#[tokio::test]
async fn test_cursor_never_moves_backwards() {
    let store = InMemoryEventStore::new("F1");
    assert_eq!(store.load_cursor("WEB").await.unwrap(), 0);

    store.save_cursor("WEB", 10).await.unwrap();
    store.save_cursor("WEB", 4).await.unwrap();

    assert_eq!(store.load_cursor("WEB").await.unwrap(), 10);
}

#[tokio::test]
async fn test_mark_replayed_unknown_event() {
    let store = InMemoryEventStore::new("F1");
    let err = store.mark_replayed(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, event_store::EventStoreError::EventNotFound(_)));
}
