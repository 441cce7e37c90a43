use core::net::SocketAddr;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::info;
use pool::BeaconPool;
use prometheus::TextEncoder;
use tokio::net::TcpListener;
use types::MetricsConfig;

use crate::proxy_metrics::ProxyMetrics;

#[derive(Clone)]
struct MetricsState {
    metrics: Arc<ProxyMetrics>,
    pool: BeaconPool,
}

/// Router serving the Prometheus text exposition at `/metrics`.
/// Mergeable into the ingress router and used by the dedicated server.
pub fn metrics_router(metrics: Arc<ProxyMetrics>, pool: BeaconPool) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(MetricsState { metrics, pool })
}

/// Serves the exposition on a dedicated listener.
pub async fn run_metrics_server(
    config: MetricsConfig,
    metrics: Arc<ProxyMetrics>,
    pool: BeaconPool,
) -> Result<()> {
    let address = SocketAddr::from((
        config.host.parse::<IpAddr>().context("invalid metrics host")?,
        config.port,
    ));

    let router = metrics_router(metrics, pool);
    let listener = TcpListener::bind(address).await?;

    info!("metrics server listening on {address}");

    axum::serve(listener, router).await.map_err(Into::into)
}

async fn serve_metrics(State(state): State<MetricsState>) -> Response {
    let ready_client_count = state
        .pool
        .get_canonical_fork()
        .map(|fork| fork.ready_clients.len())
        .unwrap_or(0);

    state.metrics.set_pool_online(ready_client_count);

    match TextEncoder::new().encode_to_string(&prometheus::default_registry().gather()) {
        Ok(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {error}"),
        )
            .into_response(),
    }
}
