//! Core data types shared by sources, stores, and workers.

mod change;
mod event;
mod lsn;

pub use change::{ChangeData, ChangeType, TrackedChange};
pub use event::{
    BufferedChangeEvent, DeliveryStatus, PendingDelivery, ReceiverDeliveryStatus,
    ReceiverSubscription, StatusUpdate,
};
pub use lsn::{LSN_SIZE, Lsn, LsnError};
