use relay_config::shared::{
    ComponentConfig, ConnectionConfig, ReceiverConfig, RelayConfig, StoreConfig,
    TrackingInstanceConfig,
};
use serde_json::{Value, json};

use crate::source::memory::MemorySourceFactory;
use crate::test_utils::receiver::RecordingReceiver;

/// Name of the connection created by [`relay_config`].
pub const TEST_CONNECTION: &str = "memory";

/// Capture instance the in-memory log assigns to `dbo.<table>`.
pub fn capture_instance(table: &str) -> String {
    format!("dbo_{table}")
}

/// A tracking instance over `dbo.<table>` polled every 10ms.
pub fn tracking_instance(name: &str, table: &str) -> TrackingInstanceConfig {
    serde_json::from_value(json!({
        "name": name,
        "connection": TEST_CONNECTION,
        "schema": "dbo",
        "table": table,
        "poll_interval_ms": 10
    }))
    .expect("test tracking instance must deserialize")
}

/// A recording receiver of `tracking_instance` polled every 10ms.
pub fn receiver_config(name: &str, tracking_instance: &str) -> ReceiverConfig {
    serde_json::from_value(json!({
        "name": name,
        "tracking_instance": tracking_instance,
        "type": RecordingReceiver::NAME,
        "poll_interval_ms": 10,
        "delivery_timeout_ms": 1_000
    }))
    .expect("test receiver must deserialize")
}

pub fn component(kind: &str, parameters: Value) -> ComponentConfig {
    serde_json::from_value(json!({"type": kind, "parameters": parameters}))
        .expect("test component must deserialize")
}

/// A relay configuration with an in-memory store and a single in-memory connection.
pub fn relay_config(
    tracking_instances: Vec<TrackingInstanceConfig>,
    receivers: Vec<ReceiverConfig>,
) -> RelayConfig {
    let connection: ConnectionConfig = serde_json::from_value(json!({
        "name": TEST_CONNECTION,
        "type": MemorySourceFactory::NAME
    }))
    .expect("test connection must deserialize");

    RelayConfig {
        store: StoreConfig::Memory,
        connections: vec![connection],
        tracking_instances,
        receivers,
        metrics: None,
    }
}
