use std::collections::HashSet;

use serde::Deserialize;

use crate::Config;
use crate::shared::{
    ConnectionConfig, MetricsConfig, ReceiverConfig, StoreConfig, TrackingInstanceConfig,
    ValidationError,
};

/// Complete configuration of a relay deployment.
///
/// Describes where changes come from, where they are buffered and who receives them. This is read
/// once at startup and never mutated.
///
/// This intentionally does not implement `Serialize` to avoid leaking secrets.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub tracking_instances: Vec<TrackingInstanceConfig>,
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Exposes Prometheus metrics when present.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

impl RelayConfig {
    /// Validates every section and the references between them.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.store.validate()?;

        ensure_unique("connection", self.connections.iter().map(|c| c.name.as_str()))?;
        ensure_unique(
            "tracking instance",
            self.tracking_instances.iter().map(|t| t.name.as_str()),
        )?;
        ensure_unique("receiver", self.receivers.iter().map(|r| r.name.as_str()))?;

        let connections: HashSet<&str> = self.connections.iter().map(|c| c.name.as_str()).collect();
        for tracking_instance in &self.tracking_instances {
            tracking_instance.validate()?;

            if !connections.contains(tracking_instance.connection.as_str()) {
                return Err(ValidationError::UnknownConnection {
                    tracking_instance: tracking_instance.name.clone(),
                    connection: tracking_instance.connection.clone(),
                });
            }
        }

        for receiver in &self.receivers {
            receiver.validate()?;

            if self.tracking_instance(&receiver.tracking_instance).is_none() {
                return Err(ValidationError::UnknownTrackingInstance {
                    receiver: receiver.name.clone(),
                    tracking_instance: receiver.tracking_instance.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    pub fn tracking_instance(&self, name: &str) -> Option<&TrackingInstanceConfig> {
        self.tracking_instances.iter().find(|t| t.name == name)
    }
}

impl Config for RelayConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

fn ensure_unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ValidationError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }

    Ok(())
}
