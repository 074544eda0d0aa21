use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Backend holding the change buffer, the delivery ledger and the read cursors.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StoreConfig {
    /// Keeps everything in process memory. Nothing survives a restart.
    Memory,
    Postgres { connection: PgConnectionConfig },
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Postgres { connection } => connection.validate(),
        }
    }
}
