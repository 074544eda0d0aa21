use relay_config::shared::{IntoConnectOptions, PgConnectionConfig, TlsConfig};
use sqlx::{Connection, Executor, PgConnection, PgPool};
use uuid::Uuid;

use crate::migrations::apply_relay_migrations;
use crate::store::postgres::PostgresStore;

/// Builds the connection configuration of a fresh, uniquely named test database.
///
/// Configuration is read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname
/// - `TESTS_DATABASE_PORT`: Postgres server port
/// - `TESTS_DATABASE_USERNAME`: Database user
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
///
/// Returns `None` when `TESTS_DATABASE_HOST` is unset, so database tests can be skipped on
/// machines without Postgres.
///
/// # Panics
///
/// Panics when the host is set but the port or username are missing or invalid.
pub fn local_pg_connection_config() -> Option<PgConnectionConfig> {
    let host = std::env::var("TESTS_DATABASE_HOST").ok()?;

    Some(PgConnectionConfig {
        host,
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig::disabled(),
    })
}

/// A migrated database backing a [`PostgresStore`].
pub struct StoreDatabase {
    pub config: PgConnectionConfig,
    /// Direct access to the database, for assertions the store API doesn't cover.
    pub pool: PgPool,
    pub store: PostgresStore,
}

/// Creates a new database with the relay migrations applied.
///
/// Returns `None` when no test database is configured, see [`local_pg_connection_config`].
///
/// # Panics
///
/// Panics if the database cannot be created or migrated.
pub async fn spawn_store_database() -> Option<StoreDatabase> {
    let Some(config) = local_pg_connection_config() else {
        eprintln!("skipping: TESTS_DATABASE_HOST is not set");
        return None;
    };

    let mut connection = PgConnection::connect_with(&config.without_db(None))
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"create database "{}";"#, config.name))
        .await
        .expect("Failed to create database");

    apply_relay_migrations(&config)
        .await
        .expect("Failed to apply relay migrations");

    let pool = PgPool::connect_with(config.with_db(None))
        .await
        .expect("Failed to connect to the test database");
    let store = PostgresStore::new(&config);

    Some(StoreDatabase {
        config,
        pool,
        store,
    })
}

impl StoreDatabase {
    /// Drops the database, terminating any connection still open on it.
    ///
    /// Failures are only printed so cleanup never fails a test.
    pub async fn drop_database(self) {
        self.pool.close().await;

        let mut connection = match PgConnection::connect_with(&self.config.without_db(None)).await
        {
            Ok(connection) => connection,
            Err(err) => {
                eprintln!("warning: failed to connect to Postgres for cleanup: {err}");
                return;
            }
        };

        if let Err(err) = connection
            .execute(&*format!(
                r#"
                select pg_terminate_backend(pg_stat_activity.pid)
                from pg_stat_activity
                where pg_stat_activity.datname = '{}'
                and pid <> pg_backend_pid();"#,
                self.config.name
            ))
            .await
        {
            eprintln!(
                "warning: failed to terminate connections for database {}: {err}",
                self.config.name
            );
        }

        if let Err(err) = connection
            .execute(&*format!(r#"drop database if exists "{}";"#, self.config.name))
            .await
        {
            eprintln!("warning: failed to drop database {}: {err}", self.config.name);
        }
    }
}
