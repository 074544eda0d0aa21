//! Delivery targets for change events.

mod log;
mod webhook;

pub use log::LogReceiver;
pub use webhook::WebhookReceiver;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RelayResult;
use crate::types::TrackedChange;

/// Outcome reported by a receiver for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverResponse {
    pub status: ResponseStatus,
    pub error_description: Option<String>,
}

impl ReceiverResponse {
    pub fn success() -> Self {
        Self {
            status: ResponseStatus::Success,
            error_description: None,
        }
    }

    pub fn failure(error_description: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failure,
            error_description: Some(error_description.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// External target changes are delivered to.
///
/// Errors returned by [`Receiver::send`] are recorded as failed deliveries just like a
/// [`ResponseStatus::Failure`] response.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Name the receiver is registered and configured under.
    fn name(&self) -> &'static str;

    /// Checks `parameters` once, before any worker uses them.
    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()>;

    async fn send(&self, change: &TrackedChange, parameters: &Value)
    -> RelayResult<ReceiverResponse>;
}

/// Returns the document to deliver: the transformed payload when present, the change otherwise.
pub fn delivery_payload(change: &TrackedChange) -> RelayResult<Value> {
    match &change.transformed_data {
        Some(transformed) => Ok(transformed.clone()),
        None => change.to_json(),
    }
}
