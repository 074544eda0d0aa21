use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::error::RelayResult;
use crate::types::{
    PendingDelivery, ReceiverDeliveryStatus, ReceiverSubscription, StatusUpdate, TrackedChange,
};

/// Storage for buffered changes, their delivery statuses and the per-instance read cursors.
///
/// The store is the only state shared between workers. Every method must be atomic with respect
/// to the others: a batch and its status rows become visible together, and a status update only
/// ever touches the row of the given receiver.
pub trait BufferStore {
    /// Returns the row label of the last change buffered for `tracking_instance`.
    fn get_last_processed_row_label(
        &self,
        tracking_instance: &str,
    ) -> impl Future<Output = RelayResult<Option<String>>> + Send;

    /// Upserts the read cursor of `tracking_instance`.
    fn save_last_processed_row_label(
        &self,
        tracking_instance: &str,
        row_label: &str,
    ) -> impl Future<Output = RelayResult<()>> + Send;

    /// Buffers `changes` in order and creates one pending status per subscribed receiver.
    ///
    /// Subscribers are snapshotted at call time; receivers subscribed later never see these
    /// events. Returns the number of buffered events.
    fn add_changes_to_buffer(
        &self,
        changes: Vec<TrackedChange>,
    ) -> impl Future<Output = RelayResult<usize>> + Send;

    /// Returns up to `batch_size` events still to be delivered to `receiver`, oldest first.
    ///
    /// Pending events and failed events that did not exhaust their retries are returned.
    fn get_pending_changes(
        &self,
        receiver: &str,
        tracking_instance: &str,
        batch_size: u32,
    ) -> impl Future<Output = RelayResult<Vec<PendingDelivery>>> + Send;

    /// Records the outcome of a delivery step for one (event, receiver) pair.
    ///
    /// Increments the attempt count, stamps the attempt time and records error and latency.
    fn update_change_status(
        &self,
        event_id: Uuid,
        tracking_instance: &str,
        receiver: &str,
        update: StatusUpdate,
    ) -> impl Future<Output = RelayResult<()>> + Send;

    /// Deletes events of `tracking_instance` buffered more than `time_to_live` ago whose statuses
    /// are all successful. Returns the number of deleted events.
    fn cleanup(
        &self,
        tracking_instance: &str,
        time_to_live: Duration,
    ) -> impl Future<Output = RelayResult<u64>> + Send;

    /// Replaces the set of receiver subscriptions.
    ///
    /// Existing status rows are left untouched.
    fn sync_receiver_subscriptions(
        &self,
        subscriptions: Vec<ReceiverSubscription>,
    ) -> impl Future<Output = RelayResult<()>> + Send;

    /// Returns every delivery status row of an event.
    fn get_delivery_statuses(
        &self,
        event_id: Uuid,
    ) -> impl Future<Output = RelayResult<Vec<ReceiverDeliveryStatus>>> + Send;
}
