use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_config::shared::TrackingInstanceConfig;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::source::{CdcRequest, ChangeSource, EnablementCheck};
use crate::types::{Lsn, TrackedChange};
use crate::{bail, relay_error};

/// Operation code attached to every row of the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Delete,
    Insert,
    BeforeUpdate,
    AfterUpdate,
}

impl Operation {
    pub fn code(&self) -> i32 {
        match self {
            Operation::Delete => 1,
            Operation::Insert => 2,
            Operation::BeforeUpdate => 3,
            Operation::AfterUpdate => 4,
        }
    }
}

impl TryFrom<i32> for Operation {
    type Error = RelayError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Operation::Delete),
            2 => Ok(Operation::Insert),
            3 => Ok(Operation::BeforeUpdate),
            4 => Ok(Operation::AfterUpdate),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown change log operation",
                format!("operation code {other} is not one of 1, 2, 3, 4")
            ),
        }
    }
}

/// One physical row read from the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    /// Commit position of the transaction that produced the row.
    pub lsn: Lsn,
    /// Position of the row inside its transaction.
    pub seqval: Lsn,
    /// Raw operation code, validated while mapping.
    pub operation: i32,
    pub commit_time: Option<DateTime<Utc>>,
    pub columns: Map<String, Value>,
}

/// Raw access to a change log.
///
/// Every method maps to a single introspection query or procedure call of the backing engine.
pub trait ChangeLog: Send + Sync {
    /// Returns the greatest position in the log, or `None` when nothing was ever captured.
    fn max_lsn(&self) -> impl Future<Output = RelayResult<Option<Lsn>>> + Send;

    /// Returns the oldest position still retained for `capture_instance`.
    fn min_lsn(
        &self,
        capture_instance: &str,
    ) -> impl Future<Output = RelayResult<Option<Lsn>>> + Send;

    /// Returns the greatest position committed at or before `time`.
    fn lsn_at_or_before(
        &self,
        time: DateTime<Utc>,
    ) -> impl Future<Output = RelayResult<Option<Lsn>>> + Send;

    /// Returns the rows of `capture_instance` between `from` and `to`, both inclusive, ordered by
    /// position, then by sequence inside the transaction, then by operation code.
    ///
    /// Both rows of an update share position and sequence, so the operation code is what puts the
    /// before-image first.
    fn changed_rows(
        &self,
        capture_instance: &str,
        from: &Lsn,
        to: &Lsn,
    ) -> impl Future<Output = RelayResult<Vec<ChangeRow>>> + Send;

    fn is_database_enabled(&self) -> impl Future<Output = RelayResult<bool>> + Send;

    /// Returns the capture instance tracking `schema.table`, if any.
    fn capture_instance(
        &self,
        schema: &str,
        table: &str,
    ) -> impl Future<Output = RelayResult<Option<String>>> + Send;

    fn captured_columns(
        &self,
        capture_instance: &str,
    ) -> impl Future<Output = RelayResult<Vec<String>>> + Send;

    fn enable_database(&self) -> impl Future<Output = RelayResult<()>> + Send;

    /// Starts capturing `schema.table`, restricted to `captured_columns` unless empty.
    fn enable_table(
        &self,
        schema: &str,
        table: &str,
        captured_columns: &[String],
    ) -> impl Future<Output = RelayResult<()>> + Send;
}

/// Resolves read windows against a [`ChangeLog`] and turns its rows into [`TrackedChange`]s.
#[derive(Debug)]
pub struct LogChangesProvider<L> {
    log: L,
    /// Capture instance per tracking instance, filled after the first successful check.
    capture_instances: Mutex<HashMap<String, String>>,
}

impl<L> LogChangesProvider<L>
where
    L: ChangeLog,
{
    pub fn new(log: L) -> Self {
        Self {
            log,
            capture_instances: Mutex::new(HashMap::new()),
        }
    }

    /// Reads the rows following `request`, or nothing when the log has no newer position.
    pub async fn get_changed_rows(
        &self,
        tracking_instance: &TrackingInstanceConfig,
        request: &CdcRequest,
    ) -> RelayResult<Vec<ChangeRow>> {
        let capture_instance = self.resolve_capture_instance(tracking_instance).await?;

        let Some(max_lsn) = self.log.max_lsn().await? else {
            debug!(tracking_instance = %tracking_instance.name, "change log is empty");
            return Ok(Vec::new());
        };
        let Some(min_lsn) = self.log.min_lsn(&capture_instance).await? else {
            debug!(
                tracking_instance = %tracking_instance.name,
                capture_instance = %capture_instance,
                "capture instance retains no changes"
            );
            return Ok(Vec::new());
        };

        let lower = self.lower_bound(tracking_instance, request, &min_lsn).await?;
        let upper = max_lsn.next();

        if lower >= upper {
            debug!(
                tracking_instance = %tracking_instance.name,
                %lower,
                %upper,
                "change log caught up"
            );
            return Ok(Vec::new());
        }

        self.log
            .changed_rows(&capture_instance, &lower, &max_lsn)
            .await
    }

    /// Merges the physical rows into logical changes.
    ///
    /// A before-update row must be immediately followed by its after-update row. Anything else,
    /// including an unknown operation code, fails the whole batch.
    pub fn map_rows_to_tracked_changes(
        &self,
        rows: Vec<ChangeRow>,
        tracking_instance: &str,
    ) -> RelayResult<Vec<TrackedChange>> {
        let mut changes = Vec::with_capacity(rows.len());
        let mut rows = rows.into_iter();

        while let Some(row) = rows.next() {
            let created_at = row.commit_time.unwrap_or_else(Utc::now);
            let row_label = row.lsn.to_string();

            let change = match Operation::try_from(row.operation)? {
                Operation::Delete => TrackedChange::delete(
                    tracking_instance,
                    row_label,
                    created_at,
                    Value::Object(row.columns),
                ),
                Operation::Insert => TrackedChange::insert(
                    tracking_instance,
                    row_label,
                    created_at,
                    Value::Object(row.columns),
                ),
                Operation::BeforeUpdate => {
                    let after = rows.next().ok_or_else(|| {
                        relay_error!(
                            ErrorKind::InvalidData,
                            "Update before-image without after-image",
                            format!("row at {row_label} ends the batch")
                        )
                    })?;
                    if Operation::try_from(after.operation)? != Operation::AfterUpdate {
                        bail!(
                            ErrorKind::InvalidData,
                            "Update before-image without after-image",
                            format!(
                                "row at {row_label} is followed by operation code {}",
                                after.operation
                            )
                        );
                    }

                    TrackedChange::update(
                        tracking_instance,
                        row_label,
                        created_at,
                        Value::Object(row.columns),
                        Value::Object(after.columns),
                    )
                }
                Operation::AfterUpdate => bail!(
                    ErrorKind::InvalidData,
                    "Update after-image without before-image",
                    format!("row at {row_label}")
                ),
            };

            changes.push(change);
        }

        Ok(changes)
    }

    /// Checks database and table capture, caching the capture instance once both hold.
    pub async fn check_enabled(
        &self,
        tracking_instance: &TrackingInstanceConfig,
    ) -> RelayResult<EnablementCheck> {
        let table = tracking_instance.qualified_table();

        if let Some(capture_instance) = self
            .capture_instances
            .lock()
            .await
            .get(&tracking_instance.name)
        {
            return Ok(EnablementCheck {
                enabled: true,
                message: format!("Change capture is enabled for {table}"),
                capture_instance: Some(capture_instance.clone()),
            });
        }

        if !self.log.is_database_enabled().await? {
            return Ok(EnablementCheck {
                enabled: false,
                message: "Change capture is not enabled for the database".to_string(),
                capture_instance: None,
            });
        }

        let Some(capture_instance) = self
            .log
            .capture_instance(&tracking_instance.schema, &tracking_instance.table)
            .await?
        else {
            return Ok(EnablementCheck {
                enabled: false,
                message: format!("Change capture is not enabled for {table}"),
                capture_instance: None,
            });
        };

        if !tracking_instance.captured_columns.is_empty() {
            let captured = self.log.captured_columns(&capture_instance).await?;
            let missing: Vec<&str> = tracking_instance
                .captured_columns
                .iter()
                .filter(|column| !captured.contains(column))
                .map(String::as_str)
                .collect();

            if !missing.is_empty() {
                return Ok(EnablementCheck {
                    enabled: false,
                    message: format!(
                        "Columns {} of {table} are not captured by {capture_instance}",
                        missing.join(", ")
                    ),
                    capture_instance: Some(capture_instance),
                });
            }
        }

        self.capture_instances
            .lock()
            .await
            .insert(tracking_instance.name.clone(), capture_instance.clone());

        Ok(EnablementCheck {
            enabled: true,
            message: format!("Change capture is enabled for {table} via {capture_instance}"),
            capture_instance: Some(capture_instance),
        })
    }

    /// Enables capture for the database and the table, skipping whatever is already enabled.
    pub async fn enable_tracking(
        &self,
        tracking_instance: &TrackingInstanceConfig,
    ) -> RelayResult<()> {
        if !self.log.is_database_enabled().await? {
            info!(tracking_instance = %tracking_instance.name, "enabling change capture for the database");
            self.log.enable_database().await?;
        }

        let existing = self
            .log
            .capture_instance(&tracking_instance.schema, &tracking_instance.table)
            .await?;
        if existing.is_none() {
            info!(
                tracking_instance = %tracking_instance.name,
                table = %tracking_instance.qualified_table(),
                "enabling change capture for the table"
            );
            self.log
                .enable_table(
                    &tracking_instance.schema,
                    &tracking_instance.table,
                    &tracking_instance.captured_columns,
                )
                .await?;
        }

        Ok(())
    }

    async fn resolve_capture_instance(
        &self,
        tracking_instance: &TrackingInstanceConfig,
    ) -> RelayResult<String> {
        let check = self.check_enabled(tracking_instance).await?;

        match check.capture_instance {
            Some(capture_instance) if check.enabled => Ok(capture_instance),
            _ => bail!(
                ErrorKind::TrackingNotEnabled,
                "Change capture is not enabled",
                check.message
            ),
        }
    }

    async fn lower_bound(
        &self,
        tracking_instance: &TrackingInstanceConfig,
        request: &CdcRequest,
        min_lsn: &Lsn,
    ) -> RelayResult<Lsn> {
        let lower = match (&request.last_row_label, request.from_time) {
            (Some(row_label), _) => row_label.parse::<Lsn>()?.next(),
            (None, Some(from_time)) => self
                .log
                .lsn_at_or_before(from_time)
                .await?
                .unwrap_or_else(|| min_lsn.clone()),
            (None, None) => min_lsn.clone(),
        };

        if &lower < min_lsn {
            if request.last_row_label.is_some() {
                warn!(
                    tracking_instance = %tracking_instance.name,
                    %lower,
                    %min_lsn,
                    "cursor is older than the retained change log, changes in between were purged"
                );
            }
            return Ok(min_lsn.clone());
        }

        Ok(lower)
    }
}

/// [`ChangeSource`] backed by a [`LogChangesProvider`].
#[derive(Debug)]
pub struct LogChangeSource<L> {
    provider: LogChangesProvider<L>,
}

impl<L> LogChangeSource<L>
where
    L: ChangeLog,
{
    pub fn new(log: L) -> Self {
        Self {
            provider: LogChangesProvider::new(log),
        }
    }
}

#[async_trait]
impl<L> ChangeSource for LogChangeSource<L>
where
    L: ChangeLog + fmt::Debug + 'static,
{
    async fn get_changes(
        &self,
        tracking_instance: &TrackingInstanceConfig,
        request: &CdcRequest,
    ) -> RelayResult<Vec<TrackedChange>> {
        let rows = self
            .provider
            .get_changed_rows(tracking_instance, request)
            .await?;

        self.provider
            .map_rows_to_tracked_changes(rows, &tracking_instance.name)
    }

    async fn check_enabled(
        &self,
        tracking_instance: &TrackingInstanceConfig,
    ) -> RelayResult<EnablementCheck> {
        self.provider.check_enabled(tracking_instance).await
    }

    async fn enable_tracking(&self, tracking_instance: &TrackingInstanceConfig) -> RelayResult<()> {
        self.provider.enable_tracking(tracking_instance).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::source::memory::MemoryChangeLog;
    use crate::types::ChangeType;

    fn tracking_instance() -> TrackingInstanceConfig {
        serde_json::from_value(json!({
            "name": "orders",
            "connection": "erp",
            "schema": "dbo",
            "table": "Orders"
        }))
        .unwrap()
    }

    fn row(lsn: u64, operation: Operation, columns: Value) -> ChangeRow {
        let Value::Object(columns) = columns else {
            panic!("columns must be an object");
        };

        ChangeRow {
            lsn: Lsn::from(lsn),
            seqval: Lsn::from(lsn),
            operation: operation.code(),
            commit_time: None,
            columns,
        }
    }

    async fn enabled_log() -> MemoryChangeLog {
        let log = MemoryChangeLog::new();
        log.enable_database().await.unwrap();
        log.enable_table("dbo", "Orders", &[]).await.unwrap();
        log
    }

    #[test]
    fn before_and_after_rows_become_one_update() {
        let provider = LogChangesProvider::new(MemoryChangeLog::new());
        let rows = vec![
            row(10, Operation::Insert, json!({"id": 1})),
            row(11, Operation::BeforeUpdate, json!({"id": 1, "qty": 1})),
            row(11, Operation::AfterUpdate, json!({"id": 1, "qty": 2})),
            row(12, Operation::Delete, json!({"id": 1, "qty": 2})),
        ];

        let changes = provider.map_rows_to_tracked_changes(rows, "orders").unwrap();

        let types: Vec<_> = changes.iter().map(|c| c.change_type).collect();
        assert_eq!(
            types,
            vec![ChangeType::Insert, ChangeType::Update, ChangeType::Delete]
        );

        let update = &changes[1];
        assert_eq!(update.row_label, "11");
        assert_eq!(update.data.old, Some(json!({"id": 1, "qty": 1})));
        assert_eq!(update.data.new, Some(json!({"id": 1, "qty": 2})));
    }

    #[test]
    fn unknown_operation_codes_fail_the_batch() {
        let provider = LogChangesProvider::new(MemoryChangeLog::new());
        let mut bad = row(10, Operation::Insert, json!({}));
        bad.operation = 7;

        let err = provider
            .map_rows_to_tracked_changes(vec![bad], "orders")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn unpaired_update_rows_fail_the_batch() {
        let provider = LogChangesProvider::new(MemoryChangeLog::new());

        let dangling = vec![row(11, Operation::BeforeUpdate, json!({"id": 1}))];
        assert_eq!(
            provider
                .map_rows_to_tracked_changes(dangling, "orders")
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidData
        );

        let mismatched = vec![
            row(11, Operation::BeforeUpdate, json!({"id": 1})),
            row(12, Operation::Insert, json!({"id": 2})),
        ];
        assert_eq!(
            provider
                .map_rows_to_tracked_changes(mismatched, "orders")
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidData
        );

        let orphan = vec![row(11, Operation::AfterUpdate, json!({"id": 1}))];
        assert!(provider.map_rows_to_tracked_changes(orphan, "orders").is_err());
    }

    #[tokio::test]
    async fn caught_up_cursor_issues_no_changes_query() {
        let log = enabled_log().await;
        log.push_row("dbo_Orders", row(100, Operation::Insert, json!({"id": 1})))
            .await;
        let provider = LogChangesProvider::new(log.clone());

        let rows = provider
            .get_changed_rows(&tracking_instance(), &CdcRequest::after("100"))
            .await
            .unwrap();

        assert!(rows.is_empty());
        assert_eq!(log.changes_queries().await, 0);
    }

    #[tokio::test]
    async fn cursor_reads_strictly_after_the_label() {
        let log = enabled_log().await;
        for lsn in [100, 101, 102] {
            log.push_row("dbo_Orders", row(lsn, Operation::Insert, json!({"id": lsn})))
                .await;
        }
        let provider = LogChangesProvider::new(log.clone());

        let rows = provider
            .get_changed_rows(&tracking_instance(), &CdcRequest::after("100"))
            .await
            .unwrap();
        let lsns: Vec<_> = rows.iter().map(|r| r.lsn.to_string()).collect();
        assert_eq!(lsns, vec!["101", "102"]);

        let all = provider
            .get_changed_rows(&tracking_instance(), &CdcRequest::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(log.changes_queries().await, 2);
    }

    #[tokio::test]
    async fn timestamp_resolves_to_greatest_position_at_or_before_it() {
        let log = enabled_log().await;
        for (lsn, minute) in [(100, 0), (101, 10), (102, 20)] {
            let mut row = row(lsn, Operation::Insert, json!({"id": lsn}));
            row.commit_time = Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap());
            log.push_row("dbo_Orders", row).await;
        }
        let provider = LogChangesProvider::new(log);

        let from = Utc.with_ymd_and_hms(2026, 1, 1, 12, 15, 0).unwrap();
        let rows = provider
            .get_changed_rows(&tracking_instance(), &CdcRequest::from_time(from))
            .await
            .unwrap();

        let lsns: Vec<_> = rows.iter().map(|r| r.lsn.to_string()).collect();
        assert_eq!(lsns, vec!["101", "102"]);
    }

    #[tokio::test]
    async fn disabled_tracking_is_reported_not_cached() {
        let log = MemoryChangeLog::new();
        let provider = LogChangesProvider::new(log.clone());

        let check = provider.check_enabled(&tracking_instance()).await.unwrap();
        assert!(!check.enabled);
        assert_eq!(check.capture_instance, None);

        let err = provider
            .get_changed_rows(&tracking_instance(), &CdcRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TrackingNotEnabled);

        provider.enable_tracking(&tracking_instance()).await.unwrap();
        provider.enable_tracking(&tracking_instance()).await.unwrap();

        let check = provider.check_enabled(&tracking_instance()).await.unwrap();
        assert!(check.enabled);
        assert_eq!(check.capture_instance.as_deref(), Some("dbo_Orders"));
        assert_eq!(log.enable_table_calls().await, 1);
    }

    #[tokio::test]
    async fn missing_captured_columns_fail_the_check() {
        let log = MemoryChangeLog::new();
        log.enable_database().await.unwrap();
        log.enable_table("dbo", "Orders", &["id".to_string()])
            .await
            .unwrap();
        let provider = LogChangesProvider::new(log);

        let mut tracking_instance = tracking_instance();
        tracking_instance.captured_columns = vec!["id".to_string(), "status".to_string()];

        let check = provider.check_enabled(&tracking_instance).await.unwrap();
        assert!(!check.enabled);
        assert!(check.message.contains("status"));
    }
}
