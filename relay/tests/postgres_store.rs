#![cfg(feature = "test-utils")]

use std::time::Duration;

use chrono::Utc;
use relay::error::ErrorKind;
use relay::store::BufferStore;
use relay::store::postgres::PostgresStore;
use relay::test_utils::database::spawn_store_database;
use relay::types::{DeliveryStatus, ReceiverSubscription, StatusUpdate, TrackedChange};
use relay_telemetry::tracing::init_test_tracing;
use serde_json::json;
use uuid::Uuid;

fn insert(tracking_instance: &str, label: &str) -> TrackedChange {
    TrackedChange::insert(tracking_instance, label, Utc::now(), json!({"id": label}))
}

async fn subscribe(store: &PostgresStore, subscriptions: &[(&str, &str)]) {
    store
        .sync_receiver_subscriptions(
            subscriptions
                .iter()
                .map(|(receiver, tracking_instance)| {
                    ReceiverSubscription::new(*receiver, *tracking_instance)
                })
                .collect(),
        )
        .await
        .unwrap();
}

async fn pending_ids(store: &PostgresStore, receiver: &str, tracking_instance: &str) -> Vec<Uuid> {
    store
        .get_pending_changes(receiver, tracking_instance, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|pending| pending.event.id)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn cursor_is_upserted() {
    init_test_tracing();
    let Some(database) = spawn_store_database().await else {
        return;
    };
    let store = &database.store;

    assert_eq!(store.get_last_processed_row_label("orders").await.unwrap(), None);

    store.save_last_processed_row_label("orders", "100").await.unwrap();
    store.save_last_processed_row_label("orders", "103").await.unwrap();

    assert_eq!(
        store.get_last_processed_row_label("orders").await.unwrap(),
        Some("103".to_string())
    );

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_changes_are_oldest_first_and_bounded() {
    init_test_tracing();
    let Some(database) = spawn_store_database().await else {
        return;
    };
    let store = &database.store;
    subscribe(store, &[("hook", "orders")]).await;

    store
        .add_changes_to_buffer(vec![insert("orders", "1"), insert("orders", "2")])
        .await
        .unwrap();
    store
        .add_changes_to_buffer(vec![insert("orders", "3"), insert("users", "4")])
        .await
        .unwrap();

    let pending = store.get_pending_changes("hook", "orders", 2).await.unwrap();
    let labels: Vec<_> = pending
        .iter()
        .map(|pending| pending.event.change.row_label.as_str())
        .collect();
    assert_eq!(labels, vec!["1", "2"]);
    assert!(pending.iter().all(|pending| pending.attempt_count == 0));

    let all = store.get_pending_changes("hook", "orders", 10).await.unwrap();
    let labels: Vec<_> = all
        .iter()
        .map(|pending| pending.event.change.row_label.as_str())
        .collect();
    assert_eq!(labels, vec!["1", "2", "3"]);
    assert_eq!(all[0].event.tracking_instance, "orders");
    assert_eq!(all[0].event.change.data.new, Some(json!({"id": "1"})));

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn status_updates_only_touch_their_receiver() {
    init_test_tracing();
    let Some(database) = spawn_store_database().await else {
        return;
    };
    let store = &database.store;
    subscribe(store, &[("hook", "orders"), ("audit", "orders"), ("other", "users")]).await;

    store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();
    let event_id = pending_ids(store, "hook", "orders").await[0];

    let statuses = store.get_delivery_statuses(event_id).await.unwrap();
    let receivers: Vec<_> = statuses.iter().map(|s| s.receiver.as_str()).collect();
    assert_eq!(receivers, vec!["audit", "hook"]);
    assert!(statuses.iter().all(|s| s.status == DeliveryStatus::Pending));

    store
        .update_change_status(event_id, "orders", "hook", StatusUpdate::success(12))
        .await
        .unwrap();

    assert!(pending_ids(store, "hook", "orders").await.is_empty());
    assert_eq!(pending_ids(store, "audit", "orders").await, vec![event_id]);

    let statuses = store.get_delivery_statuses(event_id).await.unwrap();
    assert_eq!(statuses[0].receiver, "audit");
    assert_eq!(statuses[0].status, DeliveryStatus::Pending);
    assert_eq!(statuses[0].attempt_count, 0);
    assert_eq!(statuses[1].receiver, "hook");
    assert_eq!(statuses[1].status, DeliveryStatus::Success);
    assert_eq!(statuses[1].attempt_count, 1);
    assert_eq!(statuses[1].last_latency_ms, Some(12));

    let err = store
        .update_change_status(event_id, "users", "hook", StatusUpdate::success(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_deliveries_stay_pending_until_exhausted() {
    init_test_tracing();
    let Some(database) = spawn_store_database().await else {
        return;
    };
    let store = &database.store;
    subscribe(store, &[("hook", "orders")]).await;

    store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();
    let event_id = pending_ids(store, "hook", "orders").await[0];

    store
        .update_change_status(event_id, "orders", "hook", StatusUpdate::failed("503", Some(10)))
        .await
        .unwrap();
    store
        .update_change_status(event_id, "orders", "hook", StatusUpdate::failed("503", Some(20)))
        .await
        .unwrap();

    let pending = store.get_pending_changes("hook", "orders", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_count, 2);

    let status = &store.get_delivery_statuses(event_id).await.unwrap()[0];
    assert_eq!(status.status, DeliveryStatus::Failed);
    assert_eq!(status.last_error.as_deref(), Some("503"));
    assert_eq!(status.last_latency_ms, Some(20));
    assert_eq!(status.avg_latency_ms, Some(15.0));
    assert_eq!(status.latency_samples, 2);

    store
        .update_change_status(event_id, "orders", "hook", StatusUpdate::exhausted(2))
        .await
        .unwrap();

    assert!(pending_ids(store, "hook", "orders").await.is_empty());
    let status = &store.get_delivery_statuses(event_id).await.unwrap()[0];
    assert!(status.exhausted);
    assert_eq!(status.attempt_count, 3);
    assert_eq!(
        status.last_error.as_deref(),
        Some("exceeded retry limit of 2 attempts")
    );
    // An exhausted step carries no latency, so the average is unchanged.
    assert_eq!(status.avg_latency_ms, Some(15.0));

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_subscribers_do_not_see_older_events() {
    init_test_tracing();
    let Some(database) = spawn_store_database().await else {
        return;
    };
    let store = &database.store;
    subscribe(store, &[("hook", "orders")]).await;
    store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();

    subscribe(store, &[("hook", "orders"), ("late", "orders")]).await;
    store.add_changes_to_buffer(vec![insert("orders", "2")]).await.unwrap();

    let late = store.get_pending_changes("late", "orders", 10).await.unwrap();
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].event.change.row_label, "2");
    assert_eq!(pending_ids(store, "hook", "orders").await.len(), 2);

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_keeps_events_with_outstanding_deliveries() {
    init_test_tracing();
    let Some(database) = spawn_store_database().await else {
        return;
    };
    let store = &database.store;
    subscribe(store, &[("hook", "orders"), ("audit", "orders")]).await;

    store
        .add_changes_to_buffer(vec![
            insert("orders", "1"),
            insert("orders", "2"),
            insert("orders", "3"),
        ])
        .await
        .unwrap();
    let ids = pending_ids(store, "hook", "orders").await;

    // Fully delivered.
    for receiver in ["hook", "audit"] {
        store
            .update_change_status(ids[0], "orders", receiver, StatusUpdate::success(1))
            .await
            .unwrap();
    }
    // One receiver still pending.
    store
        .update_change_status(ids[1], "orders", "hook", StatusUpdate::success(1))
        .await
        .unwrap();
    // Given up on, which is not a success.
    for receiver in ["hook", "audit"] {
        store
            .update_change_status(ids[2], "orders", receiver, StatusUpdate::exhausted(1))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(store.cleanup("orders", Duration::from_secs(3600)).await.unwrap(), 0);
    assert_eq!(store.cleanup("users", Duration::from_millis(1)).await.unwrap(), 0);
    assert_eq!(store.cleanup("orders", Duration::from_millis(1)).await.unwrap(), 1);

    assert!(store.get_delivery_statuses(ids[0]).await.unwrap().is_empty());
    assert_eq!(pending_ids(store, "audit", "orders").await, vec![ids[1]]);
    assert_eq!(store.get_delivery_statuses(ids[2]).await.unwrap().len(), 2);

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_status_insert_rolls_back_the_whole_batch() {
    init_test_tracing();
    let Some(database) = spawn_store_database().await else {
        return;
    };
    let store = &database.store;
    subscribe(store, &[("hook", "orders")]).await;

    // Any status insert now fails after its event row was written.
    sqlx::query("alter table relay.delivery_status rename to delivery_status_moved")
        .execute(&database.pool)
        .await
        .unwrap();

    let result = store
        .add_changes_to_buffer(vec![insert("orders", "1"), insert("orders", "2")])
        .await;
    assert!(result.is_err());

    sqlx::query("alter table relay.delivery_status_moved rename to delivery_status")
        .execute(&database.pool)
        .await
        .unwrap();

    let (events,): (i64,) = sqlx::query_as("select count(*) from relay.buffered_events")
        .fetch_one(&database.pool)
        .await
        .unwrap();
    assert_eq!(events, 0);
    assert!(pending_ids(store, "hook", "orders").await.is_empty());

    database.drop_database().await;
}
