use anyhow::{ensure, Context as _, Result};
use types::Config;

use crate::args::DugtrioArgs;

/// Loads the YAML configuration and applies command line / environment
/// overrides. Invalid configuration is a fatal startup error.
pub fn load_config(args: &DugtrioArgs) -> Result<Config> {
    let file = std::fs::File::open(&args.config)
        .with_context(|| format!("error opening config file {:?}", args.config))?;

    let mut config: Config =
        serde_yaml::from_reader(file).context("error decoding config file")?;

    if let Some(host) = &args.server_host {
        config.server.host = host.clone();
    }

    if let Some(port) = args.server_port {
        config.server.port = port;
    }

    if let Some(enabled) = args.metrics_enabled {
        config.metrics.enabled = enabled;
    }

    if let Some(level) = &args.log_level {
        config.logging.output_level = level.clone();
    }

    if let Some(blocked_paths) = &args.blocked_paths {
        config.proxy.blocked_paths_str = blocked_paths.clone();
    }

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    ensure!(
        !config.endpoints.is_empty(),
        "missing beacon node endpoints (need at least 1 endpoint)",
    );

    ensure!(
        config.pool.follow_distance > 0,
        "pool.followDistance must be non-zero",
    );

    Ok(())
}
