use serde::Deserialize;
use serde_json::Value;

use crate::shared::{ComponentConfig, ValidationError};

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_BATCH_SIZE: u32 = 100;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 30_000;

/// An external delivery target consuming the events of one tracking instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    pub name: String,
    pub tracking_instance: String,
    /// Name of the receiver implementation, e.g. `Webhook`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub filter: Option<ComponentConfig>,
    #[serde(default)]
    pub transformer: Option<ComponentConfig>,
    /// Number of delivery attempts after which an event is given up on. `None` retries forever.
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Upper bound for a single send, independent of the receiver's own timeouts.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let owner = || format!("receiver `{}`", self.name);

        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyValue {
                owner: "a receiver".to_string(),
                field: "name",
            });
        }

        let zero_fields = [
            ("poll_interval_ms", self.poll_interval_ms == 0),
            ("batch_size", self.batch_size == 0),
            ("delivery_timeout_ms", self.delivery_timeout_ms == 0),
        ];
        if let Some((field, _)) = zero_fields.into_iter().find(|(_, is_zero)| *is_zero) {
            return Err(ValidationError::ZeroValue {
                owner: owner(),
                field,
            });
        }

        Ok(())
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_delivery_timeout_ms() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_MS
}
