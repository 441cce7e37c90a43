use core::time::Duration;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
};

pub static METRICS: OnceCell<Arc<ProxyMetrics>> = OnceCell::new();

/// Per-call proxy metric families, registered on the default registry.
pub struct ProxyMetrics {
    total_calls: IntCounter,
    client_calls: IntCounterVec,
    path_calls: IntCounterVec,
    call_duration: HistogramVec,
    call_status: IntCounterVec,
    pool_online: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self> {
        Self::with_registry(prometheus::default_registry())
    }

    fn with_registry(registry: &Registry) -> Result<Self> {
        let total_calls = IntCounter::with_opts(opts!(
            "dugtrio_calls_total",
            "The total number of proxy requests",
        ))?;

        let client_calls = IntCounterVec::new(
            opts!(
                "dugtrio_client_calls_total",
                "Number of proxy requests per client.",
            ),
            &["client"],
        )?;

        let path_calls = IntCounterVec::new(
            opts!(
                "dugtrio_path_calls_total",
                "Number of proxy requests per api path.",
            ),
            &["path"],
        )?;

        let call_duration = HistogramVec::new(
            histogram_opts!("dugtrio_call_time", "Duration of proxy requests."),
            &["client", "path"],
        )?;

        let call_status = IntCounterVec::new(
            opts!(
                "dugtrio_call_status_total",
                "Number of requests per pool client.",
            ),
            &["client", "path", "status"],
        )?;

        let pool_online = IntGauge::with_opts(opts!(
            "dugtrio_pool_online",
            "Number of online clients in the node pool.",
        ))?;

        registry.register(Box::new(total_calls.clone()))?;
        registry.register(Box::new(client_calls.clone()))?;
        registry.register(Box::new(path_calls.clone()))?;
        registry.register(Box::new(call_duration.clone()))?;
        registry.register(Box::new(call_status.clone()))?;
        registry.register(Box::new(pool_online.clone()))?;

        Ok(Self {
            total_calls,
            client_calls,
            path_calls,
            call_duration,
            call_status,
            pool_online,
        })
    }

    pub fn add_call(&self, client_name: &str, api_path: &str, duration: Duration, status: u16) {
        let trimmed_path = trim_api_path(api_path);

        self.total_calls.inc();
        self.client_calls.with_label_values(&[client_name]).inc();
        self.path_calls.with_label_values(&[&trimmed_path]).inc();

        self.call_duration
            .with_label_values(&[client_name, &trimmed_path])
            .observe(duration.as_secs_f64());

        self.call_status
            .with_label_values(&[client_name, &trimmed_path, &status.to_string()])
            .inc();
    }

    pub fn set_pool_online(&self, ready_client_count: usize) {
        self.pool_online
            .set(i64::try_from(ready_client_count).unwrap_or(i64::MAX));
    }
}

/// Collapses per-object path segments so metric labels stay bounded.
/// Hex segments become `{hex}`, numeric segments `{id}`.
fn trim_api_path(api_path: &str) -> String {
    let api_path = api_path.split('?').next().unwrap_or(api_path);

    api_path
        .split('/')
        .enumerate()
        .map(|(position, segment)| {
            if position < 2 {
                return segment;
            }

            if segment.starts_with("0x") {
                return "{hex}";
            }

            if segment.parse::<u64>().is_ok() {
                return "{id}";
            }

            segment
        })
        .collect::<Vec<_>>()
        .join("/")
}
