use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use relay_config::shared::TrackingInstanceConfig;
use tracing::{debug, error, info};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::RelayResult;
use crate::metrics::{RELAY_EVENTS_CLEANED_TOTAL, TRACKING_INSTANCE_LABEL};
use crate::store::BufferStore;
use crate::workers::base::{Worker, WorkerType};

/// Periodically purges fully delivered events of one tracking instance once they expire.
#[derive(Debug)]
pub struct CleanupWorker<S> {
    tracking_instance: Arc<TrackingInstanceConfig>,
    store: S,
    shutdown_rx: ShutdownRx,
}

impl<S> CleanupWorker<S>
where
    S: BufferStore + Send + Sync,
{
    pub fn new(
        tracking_instance: Arc<TrackingInstanceConfig>,
        store: S,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            tracking_instance,
            store,
            shutdown_rx,
        }
    }

    /// Runs one cleanup pass and returns the number of deleted events.
    pub async fn cleanup(&self) -> RelayResult<u64> {
        let name = &self.tracking_instance.name;
        let time_to_live = Duration::from_secs(self.tracking_instance.retention.time_to_live_secs);

        let deleted = self.store.cleanup(name, time_to_live).await?;
        if deleted > 0 {
            counter!(RELAY_EVENTS_CLEANED_TOTAL, TRACKING_INSTANCE_LABEL => name.clone())
                .increment(deleted);
            info!(tracking_instance = %name, deleted, "cleaned up delivered events");
        } else {
            debug!(tracking_instance = %name, "nothing to clean up");
        }

        Ok(deleted)
    }
}

impl<S> Worker for CleanupWorker<S>
where
    S: BufferStore + Send + Sync + 'static,
{
    fn worker_type(&self) -> WorkerType {
        WorkerType::Cleanup {
            tracking_instance: self.tracking_instance.name.clone(),
        }
    }

    async fn run(mut self) -> RelayResult<()> {
        let interval = Duration::from_secs(self.tracking_instance.retention.cleanup_interval_secs);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for_shutdown() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(err) = self.cleanup().await {
                error!(
                    tracking_instance = %self.tracking_instance.name,
                    error = %err,
                    "cleanup failed"
                );
            }
        }

        debug!(tracking_instance = %self.tracking_instance.name, "cleanup worker stopped");

        Ok(())
    }
}
