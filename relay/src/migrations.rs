use relay_config::shared::{IntoConnectOptions, PgConnectionConfig, RELAY_MIGRATION_OPTIONS};
use sqlx::{Executor, postgres::PgPoolOptions};
use tracing::info;

/// Runs the buffer store migrations inside the `relay` schema.
///
/// The `search_path` is pinned to `relay` so the `_sqlx_migrations` metadata table lands next to
/// the buffer tables instead of in the public schema.
pub async fn apply_relay_migrations(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::Error> {
    let options = connection_config.with_db(Some(&RELAY_MIGRATION_OPTIONS));

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists relay;").await?;
                conn.execute("set search_path = 'relay';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!("applying relay migrations before starting the orchestrator");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;

    info!("relay migrations successfully applied");

    Ok(())
}
