use std::fmt;
use std::future::Future;

use crate::error::RelayResult;

/// Classification of relay workers, used to label logs and worker failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerType {
    /// Moves changes of one tracking instance from its change log into the buffer.
    Source { tracking_instance: String },
    /// Delivers buffered changes to one receiver.
    Receiver { receiver: String },
    /// Removes fully delivered, expired changes of one tracking instance.
    Cleanup { tracking_instance: String },
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Source { tracking_instance } => write!(f, "source({tracking_instance})"),
            WorkerType::Receiver { receiver } => write!(f, "receiver({receiver})"),
            WorkerType::Cleanup { tracking_instance } => write!(f, "cleanup({tracking_instance})"),
        }
    }
}

/// A long running loop driven until its shutdown signal fires.
pub trait Worker {
    fn worker_type(&self) -> WorkerType;

    /// Runs the worker to completion.
    ///
    /// Errors inside one iteration are logged by the worker itself; an error is only returned
    /// when the worker can't continue at all.
    fn run(self) -> impl Future<Output = RelayResult<()>> + Send;
}
