use relay::factory::ComponentFactory;
use relay::migrations::apply_relay_migrations;
use relay::orchestrator::Orchestrator;
use relay::store::BufferStore;
use relay::store::memory::MemoryStore;
use relay::store::postgres::PostgresStore;
use relay_config::shared::{PgConnectionConfig, ReceiverConfig, RelayConfig, StoreConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

/// Builds the store selected by the configuration and runs the orchestrator on it.
pub async fn start_relay_with_config(config: RelayConfig) -> anyhow::Result<()> {
    info!("starting relay service");

    log_config(&config);

    let factory = ComponentFactory::with_defaults()?;

    // Every store gets its own orchestrator instantiation, stores are statically dispatched.
    match config.store.clone() {
        StoreConfig::Memory => {
            warn!("using the memory store, buffered changes are lost on restart");

            let orchestrator = Orchestrator::new(config, MemoryStore::new(), factory);
            start_orchestrator(orchestrator).await?;
        }
        StoreConfig::Postgres { connection } => {
            log_pg_connection_config(&connection);

            apply_relay_migrations(&connection).await?;
            info!("relay migrations applied");

            let store = PostgresStore::new(&connection);
            let orchestrator = Orchestrator::new(config, store, factory);
            start_orchestrator(orchestrator).await?;
        }
    }

    info!("relay service completed");

    Ok(())
}

fn log_config(config: &RelayConfig) {
    for connection in &config.connections {
        debug!(name = %connection.name, kind = %connection.kind, "connection config");
    }

    for tracking_instance in &config.tracking_instances {
        debug!(
            name = %tracking_instance.name,
            connection = %tracking_instance.connection,
            table = %tracking_instance.qualified_table(),
            active = tracking_instance.active,
            poll_interval_ms = tracking_instance.poll_interval_ms,
            time_to_live_secs = tracking_instance.retention.time_to_live_secs,
            "tracking instance config"
        );
    }

    for receiver in &config.receivers {
        log_receiver_config(receiver);
    }
}

fn log_receiver_config(config: &ReceiverConfig) {
    debug!(
        name = %config.name,
        tracking_instance = %config.tracking_instance,
        kind = %config.kind,
        filter = config.filter.as_ref().map(|filter| filter.kind.as_str()),
        transformer = config.transformer.as_ref().map(|transformer| transformer.kind.as_str()),
        retry_count = config.retry_count,
        batch_size = config.batch_size,
        poll_interval_ms = config.poll_interval_ms,
        "receiver config"
    );
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "store postgres connection config",
    );
}

/// Starts the orchestrator and shuts it down on SIGINT or SIGTERM.
///
/// Returns once every worker has completed.
async fn start_orchestrator<S>(mut orchestrator: Orchestrator<S>) -> anyhow::Result<()>
where
    S: BufferStore + Clone + Send + Sync + 'static,
{
    orchestrator.start().await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_tx = orchestrator.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down relay");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down relay");
            }
        }

        shutdown_tx.shutdown();
    });

    let result = orchestrator.wait().await;

    // Workers only stop after a signal, but the listener is aborted in case they failed first.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;

    Ok(())
}
