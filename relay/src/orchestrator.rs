use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relay_config::shared::{ReceiverConfig, RelayConfig, TrackingInstanceConfig};
use tracing::{error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, RelayResult};
use crate::factory::{Bound, ComponentFactory};
use crate::filter::Filter;
use crate::receiver::Receiver;
use crate::source::ChangeSource;
use crate::store::BufferStore;
use crate::transform::Transformer;
use crate::types::ReceiverSubscription;
use crate::workers::cleanup::CleanupWorker;
use crate::workers::pool::WorkerPool;
use crate::workers::receiver::ReceiverWorker;
use crate::workers::source::SourceWorker;

/// Lifecycle of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Stopped => "stopped",
            OrchestratorState::Starting => "starting",
            OrchestratorState::Running => "running",
            OrchestratorState::Stopping => "stopping",
        };

        f.write_str(name)
    }
}

/// Components of one tracking instance, resolved before any worker is spawned.
struct ResolvedTrackingInstance {
    config: Arc<TrackingInstanceConfig>,
    source: Arc<dyn ChangeSource>,
}

/// Components of one receiver, resolved before any worker is spawned.
struct ResolvedReceiver {
    config: Arc<ReceiverConfig>,
    receiver: Bound<dyn Receiver>,
    filter: Option<Bound<dyn Filter>>,
    transformer: Option<Bound<dyn Transformer>>,
}

/// Runs one source and one cleanup worker per active tracking instance and one receiver worker
/// per receiver, all sharing a single shutdown signal.
#[derive(Debug)]
pub struct Orchestrator<S> {
    config: Arc<RelayConfig>,
    store: S,
    factory: ComponentFactory,
    state: OrchestratorState,
    shutdown_tx: ShutdownTx,
    pool: WorkerPool,
}

impl<S> Orchestrator<S>
where
    S: BufferStore + Clone + Send + Sync + 'static,
{
    pub fn new(config: RelayConfig, store: S, factory: ComponentFactory) -> Self {
        // Only the sender is kept, every worker subscribes its own receiver at spawn time.
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config: Arc::new(config),
            store,
            factory,
            state: OrchestratorState::Stopped,
            shutdown_tx,
            pool: WorkerPool::new(),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Resolves every configured component and spawns the workers.
    ///
    /// Nothing is spawned when any component fails to resolve, and the orchestrator goes back to
    /// [`OrchestratorState::Stopped`].
    pub async fn start(&mut self) -> RelayResult<()> {
        if self.state != OrchestratorState::Stopped {
            bail!(
                ErrorKind::InvalidState,
                "Orchestrator is already started",
                format!("current state is {}", self.state)
            );
        }

        self.state = OrchestratorState::Starting;
        info!(
            tracking_instances = self.config.tracking_instances.len(),
            receivers = self.config.receivers.len(),
            "starting orchestrator"
        );

        match self.launch().await {
            Ok(()) => {
                self.state = OrchestratorState::Running;
                info!(workers = self.pool.len(), "orchestrator is running");

                Ok(())
            }
            Err(err) => {
                // Workers spawned before the failure are stopped so none outlives the failed start.
                self.shutdown_tx.shutdown();
                if let Err(wait_err) = self.pool.wait_all().await {
                    error!(error = %wait_err, "workers failed while aborting start");
                }
                self.state = OrchestratorState::Stopped;

                error!(error = %err, "orchestrator failed to start");

                Err(err)
            }
        }
    }

    async fn launch(&mut self) -> RelayResult<()> {
        // A signal raised by a previous run is sticky, so a restart needs a fresh channel.
        if self.shutdown_tx.subscribe().is_shutdown() {
            let (shutdown_tx, _) = create_shutdown_channel();
            self.shutdown_tx = shutdown_tx;
        }

        // We resolve everything up front, an unknown component name must fail the start before
        // any worker runs.
        let tracking_instances = self.resolve_tracking_instances()?;
        let receivers = self.resolve_receivers()?;

        for tracking_instance in &tracking_instances {
            self.prepare_tracking(tracking_instance).await;
        }

        // Subscriptions are in place before the first change is buffered, so every event gets a
        // status row for each configured receiver.
        let subscriptions = self
            .config
            .receivers
            .iter()
            .map(|receiver| {
                ReceiverSubscription::new(receiver.name.clone(), receiver.tracking_instance.clone())
            })
            .collect();
        self.store.sync_receiver_subscriptions(subscriptions).await?;

        for tracking_instance in tracking_instances {
            self.pool.spawn(SourceWorker::new(
                tracking_instance.config.clone(),
                tracking_instance.source,
                self.store.clone(),
                self.shutdown_tx.subscribe(),
            ));
            self.pool.spawn(CleanupWorker::new(
                tracking_instance.config,
                self.store.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }

        for receiver in receivers {
            self.pool.spawn(ReceiverWorker::new(
                receiver.config,
                receiver.receiver,
                receiver.filter,
                receiver.transformer,
                self.store.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }

        Ok(())
    }

    fn resolve_tracking_instances(&self) -> RelayResult<Vec<ResolvedTrackingInstance>> {
        // Sources are created once per connection and shared by the tracking instances using it.
        let mut sources: HashMap<&str, Arc<dyn ChangeSource>> = HashMap::new();
        let mut resolved = Vec::new();

        for tracking_instance in &self.config.tracking_instances {
            if !tracking_instance.active {
                info!(tracking_instance = %tracking_instance.name, "tracking instance is inactive, skipping");
                continue;
            }

            let source = match sources.get(tracking_instance.connection.as_str()) {
                Some(source) => source.clone(),
                None => {
                    let Some(connection) = self.config.connection(&tracking_instance.connection)
                    else {
                        bail!(
                            ErrorKind::ConfigError,
                            "Unknown connection",
                            format!(
                                "tracking instance '{}' references connection '{}'",
                                tracking_instance.name, tracking_instance.connection
                            )
                        );
                    };

                    let source = self
                        .factory
                        .resolve_source(&connection.kind)?
                        .create(connection)?;
                    sources.insert(connection.name.as_str(), source.clone());

                    source
                }
            };

            resolved.push(ResolvedTrackingInstance {
                config: Arc::new(tracking_instance.clone()),
                source,
            });
        }

        Ok(resolved)
    }

    fn resolve_receivers(&self) -> RelayResult<Vec<ResolvedReceiver>> {
        self.config
            .receivers
            .iter()
            .map(|config| {
                let receiver = self
                    .factory
                    .resolve_receiver(&config.kind, &config.parameters)?;
                let filter = config
                    .filter
                    .as_ref()
                    .map(|filter| self.factory.resolve_filter(filter))
                    .transpose()?;
                let transformer = config
                    .transformer
                    .as_ref()
                    .map(|transformer| self.factory.resolve_transformer(transformer))
                    .transpose()?;

                Ok(ResolvedReceiver {
                    config: Arc::new(config.clone()),
                    receiver,
                    filter,
                    transformer,
                })
            })
            .collect()
    }

    async fn prepare_tracking(&self, tracking_instance: &ResolvedTrackingInstance) {
        let config = &tracking_instance.config;

        // An unreachable source is not fatal here, its worker keeps polling and recovers once the
        // source is back and tracking is enabled.
        if config.enable_tracking {
            info!(tracking_instance = %config.name, table = %config.qualified_table(), "enabling change tracking");
            if let Err(err) = tracking_instance.source.enable_tracking(config).await {
                warn!(tracking_instance = %config.name, error = %err, "could not enable change tracking");
            }
        }

        match tracking_instance.source.check_enabled(config).await {
            Ok(check) if check.enabled => {
                info!(
                    tracking_instance = %config.name,
                    capture_instance = check.capture_instance.as_deref().unwrap_or_default(),
                    "change tracking is enabled"
                );
            }
            Ok(check) => {
                warn!(tracking_instance = %config.name, message = %check.message, "change tracking is not enabled");
            }
            Err(err) => {
                warn!(tracking_instance = %config.name, error = %err, "could not check change tracking");
            }
        }
    }

    /// Signals every worker to stop. Use [`Orchestrator::wait`] to await them.
    pub fn shutdown(&mut self) {
        if self.state != OrchestratorState::Running {
            info!(state = %self.state, "orchestrator is not running, nothing to shut down");

            return;
        }

        info!("shutting down orchestrator");
        self.state = OrchestratorState::Stopping;
        self.shutdown_tx.shutdown();
    }

    /// Waits for every worker to complete.
    ///
    /// Workers only complete once shutdown is signaled, either through [`Orchestrator::shutdown`]
    /// or through a [`ShutdownTx`] obtained from [`Orchestrator::shutdown_tx`]. Errors of all
    /// workers are collected into one.
    pub async fn wait(&mut self) -> RelayResult<()> {
        if self.state == OrchestratorState::Stopped {
            info!("orchestrator was not started, nothing to wait for");

            return Ok(());
        }

        info!(workers = self.pool.len(), "waiting for workers to complete");

        let result = self.pool.wait_all().await;
        self.state = OrchestratorState::Stopped;

        match &result {
            Ok(()) => info!("orchestrator stopped"),
            Err(err) => error!(error = %err, "orchestrator stopped with errors"),
        }

        result
    }

    pub async fn shutdown_and_wait(&mut self) -> RelayResult<()> {
        self.shutdown();
        self.wait().await
    }
}
