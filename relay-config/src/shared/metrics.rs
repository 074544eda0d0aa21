use serde::Deserialize;

const DEFAULT_METRICS_PORT: u16 = 9000;

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_METRICS_PORT
}
