use core::net::SocketAddr;
use std::{net::IpAddr, sync::Arc};

use anyhow::{Context as _, Result};
use log::{error, info};
use logging::info_with_endpoints;
use metrics::{ProxyMetrics, METRICS};
use pool::BeaconPool;
use proxy::BeaconProxy;
use tokio::net::TcpListener;
use types::Config;

/// Wires the pool, proxy and metrics server together and serves until
/// interrupted.
pub async fn run(config: Config) -> Result<()> {
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(ProxyMetrics::new().context("error registering proxy metrics")?);
        METRICS.set(metrics.clone()).ok();
        Some(metrics)
    } else {
        None
    };

    let pool = BeaconPool::new(config.pool.clone())?;

    for endpoint in &config.endpoints {
        match pool.add_endpoint(endpoint) {
            Ok(_) => info!("added endpoint {} ({})", endpoint.name, endpoint.url),
            Err(error) => error!("error adding endpoint {}: {error:#}", endpoint.url),
        }
    }

    pool.start();

    let beacon_proxy = BeaconProxy::new(config.proxy.clone(), pool.clone(), metrics.clone())?;
    beacon_proxy.start();

    let mut router = proxy::create_router(beacon_proxy);

    if let Some(metrics) = &metrics {
        router = router.merge(metrics::metrics_router(metrics.clone(), pool.clone()));
    }

    let address = SocketAddr::from((
        config
            .server
            .host
            .parse::<IpAddr>()
            .context("invalid server host")?,
        config.server.port,
    ));

    let listener = TcpListener::bind(address).await?;

    info_with_endpoints!("http server listening on {address}");

    let serve_requests = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let serve_metrics = async {
        match metrics {
            Some(metrics) => {
                metrics::run_metrics_server(config.metrics.clone(), metrics, pool.clone()).await
            }
            None => futures::future::pending().await,
        }
    };

    tokio::select! {
        result = serve_requests => result.map_err(Into::into),
        result = serve_metrics => result,
        () = shutdown_signal() => {
            info!("exiting...");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!("failed to listen for the shutdown signal: {error}");
        futures::future::pending::<()>().await;
    }
}
