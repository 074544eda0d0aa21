use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ErrorKind, RelayResult};
use crate::store::BufferStore;
use crate::types::{
    BufferedChangeEvent, PendingDelivery, ReceiverDeliveryStatus, ReceiverSubscription,
    StatusUpdate, TrackedChange,
};
use crate::{bail, relay_error};

/// Inner state of [`MemoryStore`].
#[derive(Debug, Default)]
struct Inner {
    /// Last buffered row label per tracking instance.
    cursors: HashMap<String, String>,
    /// Buffered events keyed by insertion sequence, which gives the oldest-first order.
    events: BTreeMap<u64, BufferedChangeEvent>,
    /// Sequence of each buffered event.
    sequences: HashMap<Uuid, u64>,
    /// Delivery status rows of each event, keyed by receiver name.
    statuses: HashMap<Uuid, BTreeMap<String, ReceiverDeliveryStatus>>,
    subscriptions: BTreeSet<ReceiverSubscription>,
    next_sequence: u64,
}

impl Inner {
    fn subscribers(&self, tracking_instance: &str) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|subscription| subscription.tracking_instance == tracking_instance)
            .map(|subscription| subscription.receiver.clone())
            .collect()
    }
}

/// In-memory [`BufferStore`].
///
/// All state sits behind a single mutex, so every operation is trivially atomic. Everything is
/// lost on restart, which makes this store suitable for tests and local experiments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the buffered events of `tracking_instance`, oldest first.
    pub async fn buffered_events(&self, tracking_instance: &str) -> Vec<BufferedChangeEvent> {
        let inner = self.inner.lock().await;

        inner
            .events
            .values()
            .filter(|event| event.tracking_instance == tracking_instance)
            .cloned()
            .collect()
    }
}

impl BufferStore for MemoryStore {
    async fn get_last_processed_row_label(
        &self,
        tracking_instance: &str,
    ) -> RelayResult<Option<String>> {
        let inner = self.inner.lock().await;

        Ok(inner.cursors.get(tracking_instance).cloned())
    }

    async fn save_last_processed_row_label(
        &self,
        tracking_instance: &str,
        row_label: &str,
    ) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .cursors
            .insert(tracking_instance.to_string(), row_label.to_string());

        Ok(())
    }

    async fn add_changes_to_buffer(&self, changes: Vec<TrackedChange>) -> RelayResult<usize> {
        let mut inner = self.inner.lock().await;
        let buffered_at = Utc::now();
        let count = changes.len();

        for change in changes {
            let receivers = inner.subscribers(&change.tracking_instance);
            let event = BufferedChangeEvent::new(change, buffered_at);

            let statuses = receivers
                .into_iter()
                .map(|receiver| {
                    (
                        receiver.clone(),
                        ReceiverDeliveryStatus::pending(event.id, receiver),
                    )
                })
                .collect();

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.sequences.insert(event.id, sequence);
            inner.statuses.insert(event.id, statuses);
            inner.events.insert(sequence, event);
        }

        Ok(count)
    }

    async fn get_pending_changes(
        &self,
        receiver: &str,
        tracking_instance: &str,
        batch_size: u32,
    ) -> RelayResult<Vec<PendingDelivery>> {
        let inner = self.inner.lock().await;

        let pending = inner
            .events
            .values()
            .filter(|event| event.tracking_instance == tracking_instance)
            .filter_map(|event| {
                let status = inner.statuses.get(&event.id)?.get(receiver)?;
                status.is_deliverable().then(|| PendingDelivery {
                    event: event.clone(),
                    attempt_count: status.attempt_count,
                })
            })
            .take(batch_size as usize)
            .collect();

        Ok(pending)
    }

    async fn update_change_status(
        &self,
        event_id: Uuid,
        tracking_instance: &str,
        receiver: &str,
        update: StatusUpdate,
    ) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;

        let belongs_to_instance = inner
            .sequences
            .get(&event_id)
            .and_then(|sequence| inner.events.get(sequence))
            .is_some_and(|event| event.tracking_instance == tracking_instance);
        if !belongs_to_instance {
            bail!(
                ErrorKind::InvalidState,
                "Buffered event not found",
                format!("event {event_id} of tracking instance '{tracking_instance}'")
            );
        }

        let status = inner
            .statuses
            .get_mut(&event_id)
            .and_then(|statuses| statuses.get_mut(receiver))
            .ok_or_else(|| {
                relay_error!(
                    ErrorKind::InvalidState,
                    "Delivery status not found",
                    format!("event {event_id} has no status for receiver '{receiver}'")
                )
            })?;
        status.apply(&update, Utc::now());

        Ok(())
    }

    async fn cleanup(&self, tracking_instance: &str, time_to_live: Duration) -> RelayResult<u64> {
        let time_to_live = chrono::Duration::from_std(time_to_live).map_err(|err| {
            relay_error!(ErrorKind::ConfigError, "Invalid retention period", err)
        })?;
        let cutoff = Utc::now() - time_to_live;

        let mut inner = self.inner.lock().await;

        let expired: Vec<(u64, Uuid)> = inner
            .events
            .iter()
            .filter(|(_, event)| {
                event.tracking_instance == tracking_instance && event.buffered_at < cutoff
            })
            .filter(|(_, event)| {
                inner.statuses.get(&event.id).is_none_or(|statuses| {
                    statuses
                        .values()
                        .all(|status| status.status == crate::types::DeliveryStatus::Success)
                })
            })
            .map(|(sequence, event)| (*sequence, event.id))
            .collect();

        for (sequence, event_id) in &expired {
            inner.events.remove(sequence);
            inner.sequences.remove(event_id);
            inner.statuses.remove(event_id);
        }

        Ok(expired.len() as u64)
    }

    async fn sync_receiver_subscriptions(
        &self,
        subscriptions: Vec<ReceiverSubscription>,
    ) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        inner.subscriptions = subscriptions.into_iter().collect();

        Ok(())
    }

    async fn get_delivery_statuses(
        &self,
        event_id: Uuid,
    ) -> RelayResult<Vec<ReceiverDeliveryStatus>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .statuses
            .get(&event_id)
            .map(|statuses| statuses.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::types::DeliveryStatus;

    fn insert(instance: &str, label: &str) -> TrackedChange {
        TrackedChange::insert(instance, label, Utc::now(), json!({"id": label}))
    }

    async fn store_with(subscriptions: &[(&str, &str)]) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .sync_receiver_subscriptions(
                subscriptions
                    .iter()
                    .map(|(receiver, instance)| ReceiverSubscription::new(*receiver, *instance))
                    .collect(),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn cursor_is_upserted() {
        let store = MemoryStore::new();
        assert_eq!(store.get_last_processed_row_label("orders").await.unwrap(), None);

        store.save_last_processed_row_label("orders", "100").await.unwrap();
        store.save_last_processed_row_label("orders", "103").await.unwrap();

        assert_eq!(
            store.get_last_processed_row_label("orders").await.unwrap(),
            Some("103".to_string())
        );
    }

    #[tokio::test]
    async fn buffering_creates_one_pending_status_per_subscriber() {
        let store = store_with(&[("hook", "orders"), ("audit", "orders"), ("other", "users")]).await;

        store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();

        let events = store.buffered_events("orders").await;
        assert_eq!(events.len(), 1);

        let statuses = store.get_delivery_statuses(events[0].id).await.unwrap();
        let receivers: Vec<_> = statuses.iter().map(|s| s.receiver.as_str()).collect();
        assert_eq!(receivers, vec!["audit", "hook"]);
        assert!(statuses.iter().all(|s| s.status == DeliveryStatus::Pending));
    }

    #[tokio::test]
    async fn late_subscribers_do_not_see_older_events() {
        let store = store_with(&[("hook", "orders")]).await;
        store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();

        store
            .sync_receiver_subscriptions(vec![
                ReceiverSubscription::new("hook", "orders"),
                ReceiverSubscription::new("late", "orders"),
            ])
            .await
            .unwrap();
        store.add_changes_to_buffer(vec![insert("orders", "2")]).await.unwrap();

        let late = store.get_pending_changes("late", "orders", 10).await.unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].event.change.row_label, "2");

        let hook = store.get_pending_changes("hook", "orders", 10).await.unwrap();
        assert_eq!(hook.len(), 2);
    }

    #[tokio::test]
    async fn pending_changes_are_oldest_first_and_bounded() {
        let store = store_with(&[("hook", "orders")]).await;
        store
            .add_changes_to_buffer(vec![
                insert("orders", "1"),
                insert("orders", "2"),
                insert("orders", "3"),
            ])
            .await
            .unwrap();

        let pending = store.get_pending_changes("hook", "orders", 2).await.unwrap();
        let labels: Vec<_> = pending
            .iter()
            .map(|p| p.event.change.row_label.as_str())
            .collect();
        assert_eq!(labels, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn status_updates_only_touch_their_receiver() {
        let store = store_with(&[("hook", "orders"), ("audit", "orders")]).await;
        store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();
        let event_id = store.buffered_events("orders").await[0].id;

        store
            .update_change_status(event_id, "orders", "hook", StatusUpdate::success(12))
            .await
            .unwrap();

        assert!(store.get_pending_changes("hook", "orders", 10).await.unwrap().is_empty());
        assert_eq!(store.get_pending_changes("audit", "orders", 10).await.unwrap().len(), 1);

        let err = store
            .update_change_status(event_id, "users", "hook", StatusUpdate::success(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn failed_events_are_retried_until_exhausted() {
        let store = store_with(&[("hook", "orders")]).await;
        store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();
        let event_id = store.buffered_events("orders").await[0].id;

        store
            .update_change_status(event_id, "orders", "hook", StatusUpdate::failed("503", Some(5)))
            .await
            .unwrap();
        let pending = store.get_pending_changes("hook", "orders", 10).await.unwrap();
        assert_eq!(pending[0].attempt_count, 1);

        store
            .update_change_status(event_id, "orders", "hook", StatusUpdate::exhausted(1))
            .await
            .unwrap();
        assert!(store.get_pending_changes("hook", "orders", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_keeps_events_with_outstanding_deliveries() {
        let store = store_with(&[("hook", "orders"), ("audit", "orders")]).await;
        store
            .add_changes_to_buffer(vec![insert("orders", "1"), insert("orders", "2")])
            .await
            .unwrap();
        let events = store.buffered_events("orders").await;

        for receiver in ["hook", "audit"] {
            store
                .update_change_status(events[0].id, "orders", receiver, StatusUpdate::success(1))
                .await
                .unwrap();
        }
        store
            .update_change_status(events[1].id, "orders", "hook", StatusUpdate::success(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Nothing is old enough yet.
        assert_eq!(store.cleanup("orders", Duration::from_secs(3600)).await.unwrap(), 0);

        let deleted = store.cleanup("orders", Duration::from_millis(1)).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.buffered_events("orders").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, events[1].id);
    }

    #[tokio::test]
    async fn cleanup_removes_events_without_subscribers() {
        let store = MemoryStore::new();
        store.add_changes_to_buffer(vec![insert("orders", "1")]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.cleanup("orders", Duration::from_millis(1)).await.unwrap(), 1);
        assert!(store.buffered_events("orders").await.is_empty());
    }
}
