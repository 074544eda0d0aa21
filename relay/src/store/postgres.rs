use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_config::shared::{IntoConnectOptions, PgConnectionConfig, RELAY_STORE_OPTIONS};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::store::BufferStore;
use crate::types::{
    BufferedChangeEvent, DeliveryStatus, PendingDelivery, ReceiverDeliveryStatus,
    ReceiverSubscription, StatusUpdate, TrackedChange,
};
use crate::{bail, relay_error};

/// Maximum number of connections in the pool.
///
/// Source, receiver and cleanup workers all share the store, so a handful of connections avoids
/// serializing them behind one another.
const MAX_POOL_CONNECTIONS: u32 = 4;

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates a lazily connected pool with automatic idle connection cleanup.
///
/// Returns immediately without establishing any connection. Connections are opened on demand
/// and closed after being idle for [`IDLE_TIMEOUT`].
fn create_database_pool(config: &PgConnectionConfig) -> PgPool {
    let options = config.with_db(Some(&RELAY_STORE_OPTIONS));

    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(MAX_POOL_CONNECTIONS)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(options)
}

/// Converts a non-negative counter read from the database.
fn to_u32(value: i32, column: &str) -> RelayResult<u32> {
    u32::try_from(value).map_err(|_| {
        relay_error!(
            ErrorKind::InvalidData,
            "Negative counter in delivery status",
            format!("column '{column}' holds {value}")
        )
    })
}

fn to_u64(value: i64, column: &str) -> RelayResult<u64> {
    u64::try_from(value).map_err(|_| {
        relay_error!(
            ErrorKind::InvalidData,
            "Negative latency in delivery status",
            format!("column '{column}' holds {value}")
        )
    })
}

fn parse_buffered_event(row: &PgRow) -> RelayResult<BufferedChangeEvent> {
    let Json(change): Json<TrackedChange> = row.try_get("payload")?;

    Ok(BufferedChangeEvent {
        id: row.try_get("id")?,
        tracking_instance: row.try_get("tracking_instance")?,
        change,
        buffered_at: row.try_get("buffered_at")?,
    })
}

fn parse_delivery_status(row: &PgRow) -> RelayResult<ReceiverDeliveryStatus> {
    let status: String = row.try_get("status")?;
    let last_latency_ms: Option<i64> = row.try_get("last_latency_ms")?;

    Ok(ReceiverDeliveryStatus {
        event_id: row.try_get("event_id")?,
        receiver: row.try_get("receiver_name")?,
        status: status.parse()?,
        attempt_count: to_u32(row.try_get("attempt_count")?, "attempt_count")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        last_error: row.try_get("error")?,
        last_latency_ms: last_latency_ms
            .map(|value| to_u64(value, "last_latency_ms"))
            .transpose()?,
        avg_latency_ms: row.try_get("avg_latency_ms")?,
        latency_samples: to_u32(row.try_get("latency_samples")?, "latency_samples")?,
        exhausted: row.try_get("exhausted")?,
    })
}

/// Postgres-backed [`BufferStore`].
///
/// Events, delivery statuses, cursors and subscriptions live in the `relay` schema created by
/// [`crate::migrations::apply_relay_migrations`]. The database is the only source of truth, no
/// state is cached in process, so several replicas may share the same buffer as long as each
/// tracking instance and receiver runs in exactly one of them.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(config: &PgConnectionConfig) -> Self {
        Self {
            pool: create_database_pool(config),
        }
    }

    /// Creates a store on top of an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl BufferStore for PostgresStore {
    async fn get_last_processed_row_label(
        &self,
        tracking_instance: &str,
    ) -> RelayResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT last_row_label
            FROM relay.tracking_cursor
            WHERE tracking_instance = $1
            "#,
        )
        .bind(tracking_instance)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get("last_row_label")))
    }

    async fn save_last_processed_row_label(
        &self,
        tracking_instance: &str,
        row_label: &str,
    ) -> RelayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO relay.tracking_cursor (tracking_instance, last_row_label)
            VALUES ($1, $2)
            ON CONFLICT (tracking_instance)
            DO UPDATE SET last_row_label = EXCLUDED.last_row_label, updated_at = NOW()
            "#,
        )
        .bind(tracking_instance)
        .bind(row_label)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_changes_to_buffer(&self, changes: Vec<TrackedChange>) -> RelayResult<usize> {
        if changes.is_empty() {
            return Ok(0);
        }

        let buffered_at = Utc::now();
        let count = changes.len();

        let mut tx = self.pool.begin().await?;
        for change in changes {
            let event = BufferedChangeEvent::new(change, buffered_at);

            sqlx::query(
                r#"
                INSERT INTO relay.buffered_events
                    (id, tracking_instance, row_label, payload, buffered_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.id)
            .bind(&event.tracking_instance)
            .bind(&event.change.row_label)
            .bind(Json(&event.change))
            .bind(event.buffered_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO relay.delivery_status (event_id, receiver_name)
                SELECT $1, receiver_name
                FROM relay.receiver_subscriptions
                WHERE tracking_instance = $2
                "#,
            )
            .bind(event.id)
            .bind(&event.tracking_instance)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count, "buffered changes");

        Ok(count)
    }

    async fn get_pending_changes(
        &self,
        receiver: &str,
        tracking_instance: &str,
        batch_size: u32,
    ) -> RelayResult<Vec<PendingDelivery>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.tracking_instance, e.payload, e.buffered_at, ds.attempt_count
            FROM relay.buffered_events e
            JOIN relay.delivery_status ds ON ds.event_id = e.id
            WHERE e.tracking_instance = $1
              AND ds.receiver_name = $2
              AND (ds.status = 'pending' OR (ds.status = 'failed' AND NOT ds.exhausted))
            ORDER BY e.seq
            LIMIT $3
            "#,
        )
        .bind(tracking_instance)
        .bind(receiver)
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingDelivery {
                    event: parse_buffered_event(row)?,
                    attempt_count: to_u32(row.try_get("attempt_count")?, "attempt_count")?,
                })
            })
            .collect()
    }

    async fn update_change_status(
        &self,
        event_id: Uuid,
        tracking_instance: &str,
        receiver: &str,
        update: StatusUpdate,
    ) -> RelayResult<()> {
        let status = if update.success {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Failed
        };
        let latency_ms = update
            .latency_ms
            .map(i64::try_from)
            .transpose()
            .map_err(|err| relay_error!(ErrorKind::ConversionError, "Latency out of range", err))?;
        let attempted_at: DateTime<Utc> = Utc::now();

        // Column references on the right-hand side see the values before the update.
        let result = sqlx::query(
            r#"
            UPDATE relay.delivery_status ds
            SET status = $4,
                attempt_count = ds.attempt_count + 1,
                last_attempt_at = $5,
                error = $6,
                exhausted = $7,
                last_latency_ms = COALESCE($8::bigint, ds.last_latency_ms),
                avg_latency_ms = CASE
                    WHEN $8::bigint IS NULL THEN ds.avg_latency_ms
                    ELSE (COALESCE(ds.avg_latency_ms, 0) * ds.latency_samples + $8::bigint)
                        / (ds.latency_samples + 1)
                END,
                latency_samples = ds.latency_samples
                    + CASE WHEN $8::bigint IS NULL THEN 0 ELSE 1 END
            FROM relay.buffered_events e
            WHERE ds.event_id = e.id
              AND e.id = $1
              AND e.tracking_instance = $2
              AND ds.receiver_name = $3
            "#,
        )
        .bind(event_id)
        .bind(tracking_instance)
        .bind(receiver)
        .bind(status.as_str())
        .bind(attempted_at)
        .bind(update.error.as_deref())
        .bind(update.exhausted)
        .bind(latency_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!(
                ErrorKind::InvalidState,
                "Delivery status not found",
                format!(
                    "event {event_id} of tracking instance '{tracking_instance}' has no status for receiver '{receiver}'"
                )
            );
        }

        Ok(())
    }

    async fn cleanup(&self, tracking_instance: &str, time_to_live: Duration) -> RelayResult<u64> {
        let time_to_live = chrono::Duration::from_std(time_to_live).map_err(|err| {
            relay_error!(ErrorKind::ConfigError, "Invalid retention period", err)
        })?;
        let cutoff = Utc::now() - time_to_live;

        let result = sqlx::query(
            r#"
            DELETE FROM relay.buffered_events e
            WHERE e.tracking_instance = $1
              AND e.buffered_at < $2
              AND NOT EXISTS (
                  SELECT 1
                  FROM relay.delivery_status ds
                  WHERE ds.event_id = e.id AND ds.status <> 'success'
              )
            "#,
        )
        .bind(tracking_instance)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn sync_receiver_subscriptions(
        &self,
        subscriptions: Vec<ReceiverSubscription>,
    ) -> RelayResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM relay.receiver_subscriptions")
            .execute(&mut *tx)
            .await?;

        for subscription in &subscriptions {
            sqlx::query(
                r#"
                INSERT INTO relay.receiver_subscriptions (receiver_name, tracking_instance)
                VALUES ($1, $2)
                "#,
            )
            .bind(&subscription.receiver)
            .bind(&subscription.tracking_instance)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn get_delivery_statuses(
        &self,
        event_id: Uuid,
    ) -> RelayResult<Vec<ReceiverDeliveryStatus>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, receiver_name, status, attempt_count, last_attempt_at, error,
                   last_latency_ms, avg_latency_ms, latency_samples, exhausted
            FROM relay.delivery_status
            WHERE event_id = $1
            ORDER BY receiver_name
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(parse_delivery_status)
            .collect::<Result<Vec<_>, RelayError>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_counters_are_rejected() {
        assert_eq!(to_u32(3, "attempt_count").unwrap(), 3);
        assert_eq!(
            to_u32(-1, "attempt_count").unwrap_err().kind(),
            ErrorKind::InvalidData
        );
        assert_eq!(
            to_u64(-5, "last_latency_ms").unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }
}
