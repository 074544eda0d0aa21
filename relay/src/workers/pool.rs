use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::relay_error;
use crate::workers::base::{Worker, WorkerType};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn panic_error(worker_type: &WorkerType, message: String) -> RelayError {
    let (kind, description) = match worker_type {
        WorkerType::Source { .. } => (ErrorKind::SourceWorkerPanic, "Source worker panicked"),
        WorkerType::Receiver { .. } => {
            (ErrorKind::ReceiverWorkerPanic, "Receiver worker panicked")
        }
        WorkerType::Cleanup { .. } => (ErrorKind::CleanupWorkerPanic, "Cleanup worker panicked"),
    };

    relay_error!(kind, description, format!("{worker_type}: {message}"))
}

/// Owns every spawned worker task.
///
/// Panics are caught inside the task so they can be reported with the type of the worker that
/// raised them.
#[derive(Debug, Default)]
pub struct WorkerPool {
    join_set: JoinSet<(WorkerType, RelayResult<()>)>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<W>(&mut self, worker: W)
    where
        W: Worker + Send + 'static,
    {
        let worker_type = worker.worker_type();
        debug!(worker = %worker_type, "spawning worker");

        self.join_set.spawn(async move {
            let result = match AssertUnwindSafe(worker.run()).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(panic_error(&worker_type, panic_message(payload.as_ref()))),
            };

            (worker_type, result)
        });
    }

    pub fn len(&self) -> usize {
        self.join_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.join_set.is_empty()
    }

    /// Waits for every worker to finish, collecting their errors.
    pub async fn wait_all(&mut self) -> RelayResult<()> {
        let mut errors = Vec::new();

        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok((worker_type, Ok(()))) => {
                    info!(worker = %worker_type, "worker completed");
                }
                Ok((worker_type, Err(err))) => {
                    error!(worker = %worker_type, error = %err, "worker completed with error");
                    errors.push(err);
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("worker task was cancelled");
                    } else {
                        errors.push(relay_error!(
                            ErrorKind::Unknown,
                            "Worker task failed",
                            join_err
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}
