mod base;
pub mod memory;
mod provider;
pub mod sqlserver;

pub use base::{CdcRequest, ChangeSource, EnablementCheck, SourceFactory};
pub use provider::{ChangeLog, ChangeRow, LogChangeSource, LogChangesProvider, Operation};
