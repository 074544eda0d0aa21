use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::error::RelayResult;
use crate::receiver::{Receiver, ReceiverResponse, delivery_payload};
use crate::types::TrackedChange;

/// Writes every change to the log. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReceiver;

impl LogReceiver {
    pub const NAME: &'static str = "Log";
}

#[async_trait]
impl Receiver for LogReceiver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate_parameters(&self, _parameters: &Value) -> RelayResult<()> {
        Ok(())
    }

    async fn send(
        &self,
        change: &TrackedChange,
        _parameters: &Value,
    ) -> RelayResult<ReceiverResponse> {
        let payload = delivery_payload(change)?;

        info!(
            tracking_instance = %change.tracking_instance,
            row_label = %change.row_label,
            change_type = %change.change_type,
            %payload,
            "change received"
        );

        Ok(ReceiverResponse::success())
    }
}
