pub use crate::{
    proxy_metrics::{ProxyMetrics, METRICS},
    server::{metrics_router, run_metrics_server},
};

mod proxy_metrics;
mod server;
