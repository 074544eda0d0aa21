//! Configuration types shared by the relay library and the replicator binary.

mod base;
mod component;
mod connection;
mod metrics;
mod receiver;
mod relay;
mod store;
mod tracking;

pub use base::ValidationError;
pub use component::{ComponentConfig, ConnectionConfig};
pub use connection::{
    IntoConnectOptions, PgConnectionConfig, PgConnectionOptions, RELAY_MIGRATION_OPTIONS,
    RELAY_STORE_OPTIONS, TlsConfig,
};
pub use metrics::MetricsConfig;
pub use receiver::ReceiverConfig;
pub use relay::RelayConfig;
pub use store::StoreConfig;
pub use tracking::{RetentionConfig, TrackingInstanceConfig};
