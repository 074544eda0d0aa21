use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use relay_config::shared::TrackingInstanceConfig;
use tracing::{debug, error, info};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::RelayResult;
use crate::metrics::{
    RELAY_CHANGES_BUFFERED_TOTAL, RELAY_SOURCE_POLL_ERRORS_TOTAL, TRACKING_INSTANCE_LABEL,
};
use crate::source::{CdcRequest, ChangeSource};
use crate::store::BufferStore;
use crate::workers::base::{Worker, WorkerType};

/// Polls the change log of one tracking instance and appends what it finds to the buffer.
///
/// The cursor is only advanced after the batch has been buffered, so a crash in between causes
/// the batch to be read again rather than skipped.
#[derive(Debug)]
pub struct SourceWorker<S> {
    tracking_instance: Arc<TrackingInstanceConfig>,
    source: Arc<dyn ChangeSource>,
    store: S,
    shutdown_rx: ShutdownRx,
}

impl<S> SourceWorker<S>
where
    S: BufferStore + Send + Sync,
{
    pub fn new(
        tracking_instance: Arc<TrackingInstanceConfig>,
        source: Arc<dyn ChangeSource>,
        store: S,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            tracking_instance,
            source,
            store,
            shutdown_rx,
        }
    }

    /// Runs a single poll, returning the number of buffered changes.
    pub async fn poll(&self) -> RelayResult<usize> {
        let name = &self.tracking_instance.name;

        let request = match self.store.get_last_processed_row_label(name).await? {
            Some(row_label) => CdcRequest::after(row_label),
            None => match self.tracking_instance.start_from {
                Some(start_from) => CdcRequest::from_time(start_from),
                None => CdcRequest::default(),
            },
        };

        let changes = self
            .source
            .get_changes(&self.tracking_instance, &request)
            .await?;

        let Some(last_row_label) = changes.last().map(|change| change.row_label.clone()) else {
            debug!(tracking_instance = %name, "no new changes");
            return Ok(0);
        };

        let buffered = self.store.add_changes_to_buffer(changes).await?;
        self.store
            .save_last_processed_row_label(name, &last_row_label)
            .await?;

        counter!(RELAY_CHANGES_BUFFERED_TOTAL, TRACKING_INSTANCE_LABEL => name.clone())
            .increment(buffered as u64);
        info!(
            tracking_instance = %name,
            buffered,
            row_label = %last_row_label,
            "buffered changes"
        );

        Ok(buffered)
    }
}

impl<S> Worker for SourceWorker<S>
where
    S: BufferStore + Send + Sync + 'static,
{
    fn worker_type(&self) -> WorkerType {
        WorkerType::Source {
            tracking_instance: self.tracking_instance.name.clone(),
        }
    }

    async fn run(mut self) -> RelayResult<()> {
        let poll_interval = Duration::from_millis(self.tracking_instance.poll_interval_ms);
        info!(
            tracking_instance = %self.tracking_instance.name,
            table = %self.tracking_instance.qualified_table(),
            "starting source worker"
        );

        loop {
            if self.shutdown_rx.is_shutdown() {
                break;
            }

            // A failed poll leaves the cursor untouched, so the next poll reads the same window.
            if let Err(err) = self.poll().await {
                counter!(
                    RELAY_SOURCE_POLL_ERRORS_TOTAL,
                    TRACKING_INSTANCE_LABEL => self.tracking_instance.name.clone()
                )
                .increment(1);
                error!(
                    tracking_instance = %self.tracking_instance.name,
                    error = %err,
                    "source poll failed"
                );
            }

            tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for_shutdown() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!(tracking_instance = %self.tracking_instance.name, "source worker stopped");

        Ok(())
    }
}
