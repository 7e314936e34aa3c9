use ferrous_dot_domain::{CliOverrides, Config};
use tracing::error;

/// Load, override and validate the configuration. Logging is not up yet, so
/// failures are also printed to stderr.
pub fn load_config(path: Option<&str>, overrides: CliOverrides) -> anyhow::Result<Config> {
    let config = Config::load(path, overrides).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!(e)
    })?;

    config.validate().map_err(|e| {
        eprintln!("Invalid configuration: {}", e);
        error!(error = %e, "Invalid configuration");
        anyhow::anyhow!(e)
    })?;

    Ok(config)
}
