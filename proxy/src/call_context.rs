use core::time::Duration;

use tokio::{
    sync::mpsc,
    time::{sleep, sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

/// Sliding deadline for one proxied call.
///
/// A timer task watches the deadline and cancels the token when it elapses.
/// SSE relays push extensions through a small channel; extensions after
/// cancellation are no-ops. Dropping the context cancels the token, which
/// also releases the upstream response body held by the relay.
pub(crate) struct CallContext {
    token: CancellationToken,
    extend_tx: mpsc::Sender<Duration>,
}

impl CallContext {
    pub(crate) fn new(token: CancellationToken, timeout: Duration) -> Self {
        let (extend_tx, mut extend_rx) = mpsc::channel(5);
        let timer_token = token.clone();

        tokio::spawn(async move {
            let mut deadline = Instant::now() + timeout;

            loop {
                tokio::select! {
                    () = timer_token.cancelled() => break,

                    extension = extend_rx.recv() => match extension {
                        Some(extension) => deadline = Instant::now() + extension,
                        None => break,
                    },

                    () = sleep_until(deadline) => {
                        timer_token.cancel();
                        // Give pending writes a moment to unwind.
                        sleep(Duration::from_millis(10)).await;
                        break;
                    }
                }
            }
        });

        Self { token, extend_tx }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn extend(&self, timeout: Duration) {
        if self.token.is_cancelled() {
            return;
        }

        // A full queue means the timer already has fresher extensions.
        let _ = self.extend_tx.try_send(timeout);
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_elapse_cancels_the_token() {
        let context = CallContext::new(CancellationToken::new(), Duration::from_secs(1));
        let token = context.token();

        assert!(!context.is_cancelled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancelled().await;

        assert!(context.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn extensions_push_the_deadline_back() {
        let context = CallContext::new(CancellationToken::new(), Duration::from_secs(1));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(800)).await;
            assert!(!context.is_cancelled());
            context.extend(Duration::from_secs(1));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(context.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let context = CallContext::new(parent.child_token(), Duration::from_secs(60));

        parent.cancel();
        context.token().cancelled().await;

        assert!(context.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_context_cancels_the_token() {
        let context = CallContext::new(CancellationToken::new(), Duration::from_secs(60));
        let token = context.token();

        drop(context);
        token.cancelled().await;
    }
}
