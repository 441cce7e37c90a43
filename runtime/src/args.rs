use std::path::PathBuf;

use clap::Parser;
use dugtrio_version::{APPLICATION_NAME, APPLICATION_VERSION};

#[derive(Debug, Parser)]
#[clap(display_name = APPLICATION_NAME, version = APPLICATION_VERSION)]
pub struct DugtrioArgs {
    /// Path to the YAML configuration file
    #[clap(long, env = "DUGTRIO_CONFIG")]
    pub config: PathBuf,

    /// Override the HTTP server listen host
    #[clap(long, env = "DUGTRIO_SERVER_HOST")]
    pub server_host: Option<String>,

    /// Override the HTTP server listen port
    #[clap(long, env = "DUGTRIO_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// Override the metrics server state
    #[clap(long, env = "DUGTRIO_METRICS_ENABLED")]
    pub metrics_enabled: Option<bool>,

    /// Override the log output level
    #[clap(long, env = "DUGTRIO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Additional blocked path patterns, comma-joined
    #[clap(long, env = "DUGTRIO_BLOCKED_PATHS")]
    pub blocked_paths: Option<String>,
}
