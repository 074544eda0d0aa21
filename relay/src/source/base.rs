use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_config::shared::{ConnectionConfig, TrackingInstanceConfig};

use crate::error::RelayResult;
use crate::types::TrackedChange;

/// Incremental marker passed to a [`ChangeSource`].
///
/// When `last_row_label` is set the read starts strictly after it. Otherwise `from_time`, if set,
/// selects the greatest log position at or before that instant. With neither, the read starts at
/// the oldest retained position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdcRequest {
    pub last_row_label: Option<String>,
    pub from_time: Option<DateTime<Utc>>,
}

impl CdcRequest {
    pub fn after(row_label: impl Into<String>) -> Self {
        Self {
            last_row_label: Some(row_label.into()),
            from_time: None,
        }
    }

    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self {
            last_row_label: None,
            from_time: Some(time),
        }
    }
}

/// Result of checking whether a tracking instance is being captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnablementCheck {
    pub enabled: bool,
    pub message: String,
    /// Name of the change log object backing the tracked table, when one exists.
    pub capture_instance: Option<String>,
}

/// Uniform capability interface over a change-capturing database engine.
///
/// Implementations are shared between tasks and called concurrently for different tracking
/// instances.
#[async_trait]
pub trait ChangeSource: fmt::Debug + Send + Sync {
    /// Returns the changes after `request`, in log order.
    async fn get_changes(
        &self,
        tracking_instance: &TrackingInstanceConfig,
        request: &CdcRequest,
    ) -> RelayResult<Vec<TrackedChange>>;

    async fn check_enabled(
        &self,
        tracking_instance: &TrackingInstanceConfig,
    ) -> RelayResult<EnablementCheck>;

    /// Enables change capture for the tracking instance. Enabling twice is a no-op.
    async fn enable_tracking(&self, tracking_instance: &TrackingInstanceConfig) -> RelayResult<()>;
}

/// Builds [`ChangeSource`]s for connections of one declared type.
pub trait SourceFactory: Send + Sync {
    /// Connection type this factory serves, e.g. `SqlServer`.
    fn name(&self) -> &'static str;

    fn create(&self, connection: &ConnectionConfig) -> RelayResult<Arc<dyn ChangeSource>>;
}
