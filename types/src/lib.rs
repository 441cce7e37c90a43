pub use crate::{
    chain_config::ChainConfig,
    config::{
        AuthConfig, Config, EndpointConfig, LoggingConfig, MetricsConfig, PoolConfig, ProxyConfig,
        SchedulerMode, ServerConfig,
    },
    redacting_url::RedactingUrl,
};

pub mod primitives;

mod chain_config;
mod config;
mod redacting_url;
