use core::{future::Future, time::Duration};
use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;
use log::info;
use logging::error_with_endpoints;
use tokio::time::sleep;

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Spawns a long-lived task that is relaunched after a cooldown if it
/// panics. A task that returns normally is not restarted.
pub fn spawn_supervised<F, Fut>(name: &'static str, task_factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match AssertUnwindSafe(task_factory()).catch_unwind().await {
                Ok(()) => return,
                Err(payload) => {
                    let error = panics::payload_into_error(payload);
                    error_with_endpoints!("uncaught panic in {name} task: {error}");
                }
            }

            sleep(RESTART_DELAY).await;
            info!("restarting {name} task");
        }
    });
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn panicking_task_is_restarted() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        spawn_supervised("test", move || {
            let counter = counter.clone();

            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });

        while runs.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
