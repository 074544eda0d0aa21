use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Installs the global Prometheus recorder and serves `/metrics` on `port`.
///
/// Must be called from within a Tokio runtime, the HTTP listener and the upkeep of the recorder
/// run as tasks on it.
pub fn init_metrics(port: u16, instance: Option<&str>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));

    if let Some(instance) = instance {
        builder = builder.add_global_label("instance", instance);
    }

    builder.install()?;

    Ok(())
}
