use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relay_config::shared::ComponentConfig;

use crate::error::{ErrorKind, RelayResult};
use crate::filter::{ChangeTypeFilter, FieldFilter, Filter};
use crate::receiver::{LogReceiver, Receiver, WebhookReceiver};
use crate::relay_error;
use crate::source::SourceFactory;
use crate::source::sqlserver::SqlServerSourceFactory;
use crate::transform::{ProjectionTransformer, RenameTransformer, Transformer};

/// A component resolved from configuration, bound to its parameters.
#[derive(Clone)]
pub struct Bound<T: ?Sized> {
    pub component: Arc<T>,
    pub parameters: serde_json::Value,
}

impl<T: ?Sized> fmt::Debug for Bound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound").finish_non_exhaustive()
    }
}

/// Registry of pluggable implementations, keyed by the name each one reports.
///
/// Resolution happens once when the orchestrator starts; workers only ever see already-resolved
/// components. Names match exactly.
#[derive(Default, Clone)]
pub struct ComponentFactory {
    sources: HashMap<String, Arc<dyn SourceFactory>>,
    filters: HashMap<String, Arc<dyn Filter>>,
    transformers: HashMap<String, Arc<dyn Transformer>>,
    receivers: HashMap<String, Arc<dyn Receiver>>,
}

impl ComponentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory holding every built-in implementation.
    pub fn with_defaults() -> RelayResult<Self> {
        let mut factory = Self::new();

        factory
            .register_source(Arc::new(SqlServerSourceFactory))
            .register_filter(Arc::new(ChangeTypeFilter))
            .register_filter(Arc::new(FieldFilter))
            .register_transformer(Arc::new(ProjectionTransformer))
            .register_transformer(Arc::new(RenameTransformer))
            .register_receiver(Arc::new(WebhookReceiver::new()?))
            .register_receiver(Arc::new(LogReceiver));

        Ok(factory)
    }

    /// Registers a source factory, replacing any previous one with the same name.
    pub fn register_source(&mut self, source: Arc<dyn SourceFactory>) -> &mut Self {
        self.sources.insert(source.name().to_string(), source);
        self
    }

    pub fn register_filter(&mut self, filter: Arc<dyn Filter>) -> &mut Self {
        self.filters.insert(filter.name().to_string(), filter);
        self
    }

    pub fn register_transformer(&mut self, transformer: Arc<dyn Transformer>) -> &mut Self {
        self.transformers
            .insert(transformer.name().to_string(), transformer);
        self
    }

    pub fn register_receiver(&mut self, receiver: Arc<dyn Receiver>) -> &mut Self {
        self.receivers.insert(receiver.name().to_string(), receiver);
        self
    }

    pub fn resolve_source(&self, name: &str) -> RelayResult<Arc<dyn SourceFactory>> {
        resolve(&self.sources, "source", name)
    }

    /// Resolves a filter and validates its parameters.
    pub fn resolve_filter(&self, config: &ComponentConfig) -> RelayResult<Bound<dyn Filter>> {
        let filter = resolve(&self.filters, "filter", &config.kind)?;
        filter.validate_parameters(&config.parameters)?;

        Ok(Bound {
            component: filter,
            parameters: config.parameters.clone(),
        })
    }

    /// Resolves a transformer and validates its parameters.
    pub fn resolve_transformer(
        &self,
        config: &ComponentConfig,
    ) -> RelayResult<Bound<dyn Transformer>> {
        let transformer = resolve(&self.transformers, "transformer", &config.kind)?;
        transformer.validate_parameters(&config.parameters)?;

        Ok(Bound {
            component: transformer,
            parameters: config.parameters.clone(),
        })
    }

    /// Resolves a receiver and validates its parameters.
    pub fn resolve_receiver(
        &self,
        kind: &str,
        parameters: &serde_json::Value,
    ) -> RelayResult<Bound<dyn Receiver>> {
        let receiver = resolve(&self.receivers, "receiver", kind)?;
        receiver.validate_parameters(parameters)?;

        Ok(Bound {
            component: receiver,
            parameters: parameters.clone(),
        })
    }
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("sources", &sorted_names(&self.sources))
            .field("filters", &sorted_names(&self.filters))
            .field("transformers", &sorted_names(&self.transformers))
            .field("receivers", &sorted_names(&self.receivers))
            .finish()
    }
}

fn sorted_names<T: ?Sized>(registry: &HashMap<String, Arc<T>>) -> Vec<&str> {
    let mut names: Vec<&str> = registry.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

fn resolve<T: ?Sized>(
    registry: &HashMap<String, Arc<T>>,
    kind: &'static str,
    name: &str,
) -> RelayResult<Arc<T>> {
    registry.get(name).cloned().ok_or_else(|| {
        relay_error!(
            ErrorKind::ConfigError,
            "Unknown component",
            format!(
                "no {kind} named '{name}' is registered (known: {})",
                sorted_names(registry).join(", ")
            )
        )
    })
}
