use relay_config::load_config;
use relay_config::shared::RelayConfig;

/// Loads the relay configuration and validates it.
pub fn load_relay_config() -> anyhow::Result<RelayConfig> {
    let config = load_config::<RelayConfig>()?;
    config.validate()?;

    Ok(config)
}
