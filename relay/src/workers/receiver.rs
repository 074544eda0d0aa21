use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use relay_config::shared::ReceiverConfig;
use tracing::{debug, error, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, RelayResult};
use crate::factory::Bound;
use crate::filter::Filter;
use crate::metrics::{
    OUTCOME_LABEL, RECEIVER_LABEL, RELAY_DELIVERIES_TOTAL, RELAY_DELIVERY_DURATION_MILLISECONDS,
};
use crate::receiver::Receiver;
use crate::relay_error;
use crate::store::BufferStore;
use crate::transform::Transformer;
use crate::types::{PendingDelivery, StatusUpdate};
use crate::workers::base::{Worker, WorkerType};

/// Outcome of processing one pending event, used as the metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failed,
    Filtered,
    Exhausted,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Filtered => "filtered",
            Outcome::Exhausted => "exhausted",
        }
    }
}

/// Delivers the buffered events of one tracking instance to one receiver.
///
/// Each pending event goes through the retry ceiling check, the optional filter, the optional
/// transformer and finally the receiver. Whatever happens, exactly one status write is made per
/// processed event.
pub struct ReceiverWorker<S> {
    config: Arc<ReceiverConfig>,
    receiver: Bound<dyn Receiver>,
    filter: Option<Bound<dyn Filter>>,
    transformer: Option<Bound<dyn Transformer>>,
    store: S,
    shutdown_rx: ShutdownRx,
}

impl<S> ReceiverWorker<S>
where
    S: BufferStore + Send + Sync,
{
    pub fn new(
        config: Arc<ReceiverConfig>,
        receiver: Bound<dyn Receiver>,
        filter: Option<Bound<dyn Filter>>,
        transformer: Option<Bound<dyn Transformer>>,
        store: S,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            config,
            receiver,
            filter,
            transformer,
            store,
            shutdown_rx,
        }
    }

    /// Fetches one batch of pending events and processes it.
    ///
    /// Returns the number of events whose status was written. Stops early when shutdown is
    /// signaled; in-flight sends are allowed to finish.
    pub async fn process_batch(&self) -> RelayResult<usize> {
        let pending = self
            .store
            .get_pending_changes(
                &self.config.name,
                &self.config.tracking_instance,
                self.config.batch_size,
            )
            .await?;

        if pending.is_empty() {
            debug!(receiver = %self.config.name, "no pending events");
            return Ok(0);
        }

        let mut processed = 0;
        for delivery in pending {
            if self.shutdown_rx.is_shutdown() {
                info!(
                    receiver = %self.config.name,
                    processed,
                    "shutdown requested, stopping batch"
                );
                break;
            }

            let event_id = delivery.event.id;
            let (outcome, update) = self.deliver(delivery).await;

            // A failed write leaves the event pending; the rest of the batch still goes on.
            if let Err(err) = self
                .store
                .update_change_status(
                    event_id,
                    &self.config.tracking_instance,
                    &self.config.name,
                    update,
                )
                .await
            {
                error!(
                    receiver = %self.config.name,
                    event_id = %event_id,
                    error = %err,
                    "failed to record delivery status"
                );
                continue;
            }

            counter!(
                RELAY_DELIVERIES_TOTAL,
                RECEIVER_LABEL => self.config.name.clone(),
                OUTCOME_LABEL => outcome.as_str()
            )
            .increment(1);
            processed += 1;
        }

        Ok(processed)
    }

    async fn deliver(&self, delivery: PendingDelivery) -> (Outcome, StatusUpdate) {
        let PendingDelivery {
            event,
            attempt_count,
        } = delivery;

        if let Some(retry_count) = self
            .config
            .retry_count
            .filter(|retry_count| attempt_count >= *retry_count)
        {
            warn!(
                receiver = %self.config.name,
                event_id = %event.id,
                attempt_count,
                "retry limit reached, giving up on event"
            );
            return (Outcome::Exhausted, StatusUpdate::exhausted(retry_count));
        }

        let mut change = event.change;

        if let Some(filter) = &self.filter {
            match filter.component.is_match(&change, &filter.parameters) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(receiver = %self.config.name, event_id = %event.id, "event filtered out");
                    return (Outcome::Filtered, StatusUpdate::filtered_out());
                }
                Err(err) => {
                    warn!(receiver = %self.config.name, event_id = %event.id, error = %err, "filter failed");
                    return (Outcome::Failed, StatusUpdate::failed(err.message(), None));
                }
            }
        }

        if let Some(transformer) = &self.transformer {
            match transformer
                .component
                .transform(&change, &transformer.parameters)
            {
                Ok(transformed) => change.transformed_data = Some(transformed),
                Err(err) => {
                    warn!(receiver = %self.config.name, event_id = %event.id, error = %err, "transform failed");
                    return (Outcome::Failed, StatusUpdate::failed(err.message(), None));
                }
            }
        }

        let delivery_timeout = Duration::from_millis(self.config.delivery_timeout_ms);
        let started = Instant::now();
        let result = tokio::time::timeout(
            delivery_timeout,
            self.receiver
                .component
                .send(&change, &self.receiver.parameters),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        histogram!(
            RELAY_DELIVERY_DURATION_MILLISECONDS,
            RECEIVER_LABEL => self.config.name.clone()
        )
        .record(latency_ms as f64);

        let result = match result {
            Ok(result) => result,
            Err(_) => Err(relay_error!(
                ErrorKind::ReceiverTimeout,
                "Delivery timed out",
                format!("no response within {}ms", self.config.delivery_timeout_ms)
            )),
        };

        match result {
            Ok(response) if response.is_success() => {
                debug!(receiver = %self.config.name, event_id = %event.id, latency_ms, "event delivered");
                (Outcome::Success, StatusUpdate::success(latency_ms))
            }
            Ok(response) => {
                let error = response
                    .error_description
                    .unwrap_or_else(|| "receiver reported a failure".to_string());
                warn!(receiver = %self.config.name, event_id = %event.id, error = %error, "delivery rejected");
                (Outcome::Failed, StatusUpdate::failed(error, Some(latency_ms)))
            }
            Err(err) => {
                warn!(receiver = %self.config.name, event_id = %event.id, error = %err, "delivery failed");
                (
                    Outcome::Failed,
                    StatusUpdate::failed(err.message(), Some(latency_ms)),
                )
            }
        }
    }
}

impl<S> Worker for ReceiverWorker<S>
where
    S: BufferStore + Send + Sync + 'static,
{
    fn worker_type(&self) -> WorkerType {
        WorkerType::Receiver {
            receiver: self.config.name.clone(),
        }
    }

    async fn run(mut self) -> RelayResult<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            receiver = %self.config.name,
            tracking_instance = %self.config.tracking_instance,
            kind = %self.config.kind,
            "starting receiver worker"
        );

        loop {
            if self.shutdown_rx.is_shutdown() {
                break;
            }

            if let Err(err) = self.process_batch().await {
                error!(receiver = %self.config.name, error = %err, "receiver batch failed");
            }

            tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for_shutdown() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!(receiver = %self.config.name, "receiver worker stopped");

        Ok(())
    }
}
