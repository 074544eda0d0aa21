use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_config::shared::ConnectionConfig;
use tokio::sync::Mutex;

use crate::bail;
use crate::error::{ErrorKind, RelayResult};
use crate::source::{ChangeLog, ChangeRow, ChangeSource, LogChangeSource, SourceFactory};
use crate::types::Lsn;

#[derive(Debug, Default)]
struct CaptureTable {
    /// Explicitly captured columns, `None` when every column is captured.
    columns: Option<Vec<String>>,
    rows: Vec<ChangeRow>,
}

#[derive(Debug, Default)]
struct Inner {
    database_enabled: bool,
    /// Capture instance name per `(schema, table)`.
    tables: HashMap<(String, String), String>,
    captures: HashMap<String, CaptureTable>,
    changes_queries: u64,
    enable_table_calls: u64,
    failing_queries: Option<String>,
    failing_enables: Option<String>,
}

/// Scripted, in-memory [`ChangeLog`].
///
/// Rows are pushed by the caller and served back with the same windowing rules as a real log.
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeLog {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row to `capture_instance`, creating it on first use.
    pub async fn push_row(&self, capture_instance: &str, row: ChangeRow) {
        let mut inner = self.inner.lock().await;
        inner
            .captures
            .entry(capture_instance.to_string())
            .or_default()
            .rows
            .push(row);
    }

    /// Number of change queries served so far.
    pub async fn changes_queries(&self) -> u64 {
        self.inner.lock().await.changes_queries
    }

    pub async fn enable_table_calls(&self) -> u64 {
        self.inner.lock().await.enable_table_calls
    }

    /// Makes every change query fail with `message` until [`MemoryChangeLog::recover`] is called.
    pub async fn fail_queries(&self, message: impl Into<String>) {
        self.inner.lock().await.failing_queries = Some(message.into());
    }

    /// Makes every enable call fail with `message` until [`MemoryChangeLog::recover`] is called.
    pub async fn fail_enabling(&self, message: impl Into<String>) {
        self.inner.lock().await.failing_enables = Some(message.into());
    }

    pub async fn recover(&self) {
        let mut inner = self.inner.lock().await;
        inner.failing_queries = None;
        inner.failing_enables = None;
    }
}

impl ChangeLog for MemoryChangeLog {
    async fn max_lsn(&self) -> RelayResult<Option<Lsn>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .captures
            .values()
            .flat_map(|capture| capture.rows.iter().map(|row| &row.lsn))
            .max()
            .cloned())
    }

    async fn min_lsn(&self, capture_instance: &str) -> RelayResult<Option<Lsn>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .captures
            .get(capture_instance)
            .and_then(|capture| capture.rows.iter().map(|row| &row.lsn).min())
            .cloned())
    }

    async fn lsn_at_or_before(&self, time: DateTime<Utc>) -> RelayResult<Option<Lsn>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .captures
            .values()
            .flat_map(|capture| capture.rows.iter())
            .filter(|row| row.commit_time.is_some_and(|commit_time| commit_time <= time))
            .map(|row| &row.lsn)
            .max()
            .cloned())
    }

    async fn changed_rows(
        &self,
        capture_instance: &str,
        from: &Lsn,
        to: &Lsn,
    ) -> RelayResult<Vec<ChangeRow>> {
        let mut inner = self.inner.lock().await;
        inner.changes_queries += 1;

        if let Some(message) = &inner.failing_queries {
            bail!(
                ErrorKind::SourceQueryFailed,
                "Change query failed",
                message.clone()
            );
        }

        let Some(capture) = inner.captures.get(capture_instance) else {
            bail!(
                ErrorKind::SourceSchemaError,
                "Unknown capture instance",
                capture_instance
            );
        };

        let mut rows: Vec<ChangeRow> = capture
            .rows
            .iter()
            .filter(|row| &row.lsn >= from && &row.lsn <= to)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.lsn
                .cmp(&b.lsn)
                .then_with(|| a.seqval.cmp(&b.seqval))
                .then_with(|| a.operation.cmp(&b.operation))
        });

        Ok(rows)
    }

    async fn is_database_enabled(&self) -> RelayResult<bool> {
        Ok(self.inner.lock().await.database_enabled)
    }

    async fn capture_instance(&self, schema: &str, table: &str) -> RelayResult<Option<String>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .cloned())
    }

    async fn captured_columns(&self, capture_instance: &str) -> RelayResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let Some(capture) = inner.captures.get(capture_instance) else {
            return Ok(Vec::new());
        };

        if let Some(columns) = &capture.columns {
            return Ok(columns.clone());
        }

        let columns: BTreeSet<&String> = capture
            .rows
            .iter()
            .flat_map(|row| row.columns.keys())
            .collect();

        Ok(columns.into_iter().cloned().collect())
    }

    async fn enable_database(&self) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(message) = &inner.failing_enables {
            bail!(
                ErrorKind::SourceConnectionFailed,
                "Enabling change capture failed",
                message.clone()
            );
        }

        inner.database_enabled = true;

        Ok(())
    }

    async fn enable_table(
        &self,
        schema: &str,
        table: &str,
        captured_columns: &[String],
    ) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(message) = &inner.failing_enables {
            bail!(
                ErrorKind::SourceConnectionFailed,
                "Enabling change capture failed",
                message.clone()
            );
        }
        if !inner.database_enabled {
            bail!(
                ErrorKind::TrackingNotEnabled,
                "Change capture is not enabled for the database"
            );
        }

        inner.enable_table_calls += 1;

        let capture_instance = format!("{schema}_{table}");
        inner
            .tables
            .insert((schema.to_string(), table.to_string()), capture_instance.clone());

        let capture = inner.captures.entry(capture_instance).or_default();
        capture.columns = (!captured_columns.is_empty()).then(|| captured_columns.to_vec());

        Ok(())
    }
}

/// Serves the `Memory` connection type from a shared [`MemoryChangeLog`].
#[derive(Debug, Clone)]
pub struct MemorySourceFactory {
    log: MemoryChangeLog,
}

impl MemorySourceFactory {
    pub const NAME: &'static str = "Memory";

    pub fn new(log: MemoryChangeLog) -> Self {
        Self { log }
    }
}

impl SourceFactory for MemorySourceFactory {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn create(&self, _connection: &ConnectionConfig) -> RelayResult<Arc<dyn ChangeSource>> {
        Ok(Arc::new(LogChangeSource::new(self.log.clone())))
    }
}
