use core::sync::atomic::{AtomicUsize, Ordering};

pub static ENDPOINT_LOG_METRICS: EndpointLogMetrics = EndpointLogMetrics::new();

/// Pool occupancy appended to log lines emitted through the
/// `*_with_endpoints!` macros.
#[derive(Debug, Default)]
pub struct EndpointLogMetrics {
    ready_endpoint_count: AtomicUsize,
    total_endpoint_count: AtomicUsize,
}

impl core::fmt::Display for EndpointLogMetrics {
    fn fmt(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            formatter,
            "endpoints: {}/{}",
            self.ready_endpoint_count.load(Ordering::Relaxed),
            self.total_endpoint_count.load(Ordering::Relaxed),
        )
    }
}

impl EndpointLogMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ready_endpoint_count: AtomicUsize::new(0),
            total_endpoint_count: AtomicUsize::new(0),
        }
    }

    pub fn set_ready_endpoint_count(&self, ready_endpoint_count: usize) {
        self.ready_endpoint_count
            .store(ready_endpoint_count, Ordering::Relaxed)
    }

    pub fn set_total_endpoint_count(&self, total_endpoint_count: usize) {
        self.total_endpoint_count
            .store(total_endpoint_count, Ordering::Relaxed)
    }
}

#[macro_export]
macro_rules! trace_with_endpoints {
    ($($arg:tt)*) => {
        log::trace!("{} [{}]", format_args!($($arg)*), $crate::ENDPOINT_LOG_METRICS)
    };
}

#[macro_export]
macro_rules! debug_with_endpoints {
    ($($arg:tt)*) => {
        log::debug!("{} [{}]", format_args!($($arg)*), $crate::ENDPOINT_LOG_METRICS)
    };
}

#[macro_export]
macro_rules! info_with_endpoints {
    ($($arg:tt)*) => {
        log::info!("{} [{}]", format_args!($($arg)*), $crate::ENDPOINT_LOG_METRICS)
    };
}

#[macro_export]
macro_rules! warn_with_endpoints {
    ($($arg:tt)*) => {
        log::warn!("{} [{}]", format_args!($($arg)*), $crate::ENDPOINT_LOG_METRICS)
    };
}

#[macro_export]
macro_rules! error_with_endpoints {
    ($($arg:tt)*) => {
        log::error!("{} [{}]", format_args!($($arg)*), $crate::ENDPOINT_LOG_METRICS)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_log_metrics_display_shows_ready_and_total() {
        let metrics = EndpointLogMetrics::new();
        assert_eq!(metrics.to_string(), "endpoints: 0/0");

        metrics.set_ready_endpoint_count(2);
        metrics.set_total_endpoint_count(3);
        assert_eq!(metrics.to_string(), "endpoints: 2/3");
    }
}
