use std::{
    io::{self, IsTerminal},
    path::Path,
    sync::OnceLock,
};

use anyhow::Result;
use chrono::{Local, SecondsFormat};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
    reload::{self, Handle},
    EnvFilter, Registry,
};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Clone)]
pub struct TracingHandle(Handle<EnvFilter, Registry>);

impl TracingHandle {
    pub fn modify<F>(&self, f: F) -> Result<(), reload::Error>
    where
        F: FnOnce(&mut EnvFilter),
    {
        self.0.modify(f)
    }
}

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> core::fmt::Result {
        write!(
            w,
            "[{}]",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

pub fn initialize_tracing_logger(
    level: &str,
    log_file: Option<&Path>,
) -> Result<TracingHandle> {
    let mut filter = EnvFilter::default()
        .add_directive(LevelFilter::OFF.into())
        .add_directive(format!("beacon_api={level}").parse()?)
        .add_directive(format!("binary_utils={level}").parse()?)
        .add_directive(format!("dugtrio={level}").parse()?)
        .add_directive(format!("metrics={level}").parse()?)
        .add_directive(format!("pool={level}").parse()?)
        .add_directive(format!("proxy={level}").parse()?)
        .add_directive(format!("runtime={level}").parse()?);

    if let Ok(env_filter) = EnvFilter::try_from_env("DUGTRIO_LOG") {
        for directive in env_filter.to_string().split(',') {
            filter = filter.add_directive(directive.parse()?)
        }
    }

    let (filter_layer, handle) = reload::Layer::new(filter);

    let enable_ansi = io::stdout().is_terminal();

    let stdout_layer = fmt::layer::<Registry>()
        .compact()
        .with_thread_ids(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(true)
        .with_timer(LocalTimer)
        .with_ansi(enable_ansi);

    let registry = tracing_subscriber::registry().with(stdout_layer.with_filter(filter_layer));

    match log_file.map(initialize_file_writer).transpose() {
        Ok(Some(non_blocking)) => {
            let file_layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_timer(LocalTimer)
                .with_target(true)
                .with_line_number(true);

            registry.with(file_layer).init();
        }
        Ok(None) => registry.init(),
        Err(error) => {
            registry.init();
            tracing::error!("failed to initialize log file: {error}");
        }
    }

    Ok(TracingHandle(handle))
}

fn initialize_file_writer(path: &Path) -> Result<tracing_appender::non_blocking::NonBlocking> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    LOG_GUARD.set(guard).ok();

    Ok(non_blocking)
}
