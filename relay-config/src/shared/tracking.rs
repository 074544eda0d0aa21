use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::shared::ValidationError;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Seven days.
const DEFAULT_TIME_TO_LIVE_SECS: u64 = 7 * 24 * 60 * 60;

const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;

/// One captured table and how it is polled.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingInstanceConfig {
    /// Unique name, used as the owner of buffered events and of the read cursor.
    pub name: String,
    /// Name of the [`crate::shared::ConnectionConfig`] to read changes from.
    pub connection: String,
    pub schema: String,
    pub table: String,
    /// Columns to capture. Empty means every column.
    #[serde(default)]
    pub captured_columns: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Inactive instances are neither polled nor cleaned up.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Whether the orchestrator should enable capture on the source at start.
    #[serde(default)]
    pub enable_tracking: bool,
    /// Where to start reading when no cursor was persisted yet.
    #[serde(default)]
    pub start_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl TrackingInstanceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let owner = || format!("tracking instance `{}`", self.name);

        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyValue {
                owner: "a tracking instance".to_string(),
                field: "name",
            });
        }

        if self.table.trim().is_empty() {
            return Err(ValidationError::EmptyValue {
                owner: owner(),
                field: "table",
            });
        }

        if self.poll_interval_ms == 0 {
            return Err(ValidationError::ZeroValue {
                owner: owner(),
                field: "poll_interval_ms",
            });
        }

        self.retention.validate(&self.name)
    }

    /// Returns the fully qualified source table name.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// How long fully delivered events are kept and how often they are purged.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_time_to_live_secs")]
    pub time_to_live_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl RetentionConfig {
    fn validate(&self, tracking_instance: &str) -> Result<(), ValidationError> {
        let owner = || format!("tracking instance `{tracking_instance}` retention");

        if self.time_to_live_secs == 0 {
            return Err(ValidationError::ZeroValue {
                owner: owner(),
                field: "time_to_live_secs",
            });
        }

        if self.cleanup_interval_secs == 0 {
            return Err(ValidationError::ZeroValue {
                owner: owner(),
                field: "cleanup_interval_secs",
            });
        }

        Ok(())
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            time_to_live_secs: DEFAULT_TIME_TO_LIVE_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_time_to_live_secs() -> u64 {
    DEFAULT_TIME_TO_LIVE_SECS
}

fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}
