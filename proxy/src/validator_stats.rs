use core::{
    pin::Pin,
    task::{Context, Poll},
};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;

use crate::session::ProxySession;

// Observed bodies are parsed after the upstream write completes; anything
// larger than this is forwarded unobserved.
const MAX_OBSERVED_BODY: usize = 4 * 1024 * 1024;

pub(crate) const PREPARE_PROPOSER_FLAG: u8 = 0x01;
pub(crate) const COMMITTEE_SUBSCRIPTION_FLAG: u8 = 0x02;

/// Validator-stats flag for a request, when the path is one of the two
/// observed validator endpoints.
pub(crate) fn observer_flag(method: &axum::http::Method, path: &str) -> Option<u8> {
    if method != axum::http::Method::POST {
        return None;
    }

    match path {
        "/eth/v1/validator/prepare_beacon_proposer" => Some(PREPARE_PROPOSER_FLAG),
        "/eth/v1/validator/beacon_committee_subscriptions" => Some(COMMITTEE_SUBSCRIPTION_FLAG),
        _ => None,
    }
}

#[derive(Deserialize)]
struct ValidatorIndexEntry {
    validator_index: Value,
}

struct BodyObserver {
    session: Arc<ProxySession>,
    flag: u8,
    buffer: Vec<u8>,
    overflowed: bool,
}

impl BodyObserver {
    fn observe(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }

        if self.buffer.len() + chunk.len() > MAX_OBSERVED_BODY {
            self.overflowed = true;
            self.buffer.clear();
            return;
        }

        self.buffer.extend_from_slice(chunk);
    }

    fn finish(self) {
        if self.overflowed {
            return;
        }

        // Parse failures drain silently; the body was forwarded unchanged.
        let Ok(entries) = serde_json::from_slice::<Vec<ValidatorIndexEntry>>(&self.buffer) else {
            return;
        };

        let indices = entries
            .iter()
            .filter_map(|entry| match &entry.validator_index {
                Value::String(string) => string.parse().ok(),
                Value::Number(number) => number.as_u64(),
                _ => None,
            });

        self.session.add_validator_flags(indices, self.flag);
    }
}

/// Request-body passthrough that unions validator indices into the session
/// once the body has been fully forwarded. The observer never blocks the
/// upstream write.
pub(crate) struct ObservedBody<S> {
    inner: S,
    observer: Option<BodyObserver>,
}

impl<S> ObservedBody<S> {
    pub(crate) fn new(inner: S, session: Arc<ProxySession>, flag: u8) -> Self {
        Self {
            inner,
            observer: Some(BodyObserver {
                session,
                flag,
                buffer: vec![],
                overflowed: false,
            }),
        }
    }
}

impl<S, E> Stream for ObservedBody<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(observer) = self.observer.as_mut() {
                    observer.observe(&chunk);
                }

                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                if let Some(observer) = self.observer.take() {
                    observer.finish();
                }

                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use crate::session::SessionStore;

    use super::*;

    fn session() -> Arc<ProxySession> {
        SessionStore::new(0.0, 0, core::time::Duration::from_secs(600)).get_session("10.0.0.1")
    }

    async fn drive(body: &'static [u8], flag: u8) -> Arc<ProxySession> {
        let session = session();

        let chunks = body
            .chunks(7)
            .map(|chunk| Ok::<_, std::convert::Infallible>(Bytes::copy_from_slice(chunk)));

        let mut observed =
            ObservedBody::new(futures::stream::iter(chunks), session.clone(), flag);

        while observed.next().await.is_some() {}

        session
    }

    #[tokio::test]
    async fn validator_indices_are_unioned_into_the_session() {
        let session = drive(
            br#"[
                {"validator_index": "5", "fee_recipient": "0x00"},
                {"validator_index": "6", "fee_recipient": "0x00"}
            ]"#,
            PREPARE_PROPOSER_FLAG,
        )
        .await;

        let stats = session.validator_stats();

        assert_eq!(stats.count, 2);
        assert_eq!(stats.validators[0].start, 5);
        assert_eq!(stats.validators[0].length, 2);
        assert_eq!(stats.validators[0].flag, PREPARE_PROPOSER_FLAG);
    }

    #[tokio::test]
    async fn numeric_validator_indices_are_accepted() {
        let session = drive(
            br#"[{"validator_index": 9}]"#,
            COMMITTEE_SUBSCRIPTION_FLAG,
        )
        .await;

        assert_eq!(session.validator_stats().count, 1);
    }

    #[tokio::test]
    async fn malformed_bodies_are_forwarded_and_ignored() {
        let session = drive(b"not json at all", PREPARE_PROPOSER_FLAG).await;

        assert_eq!(session.validator_stats().count, 0);
    }

    #[test]
    fn only_the_two_validator_endpoints_are_observed() {
        use axum::http::Method;

        assert_eq!(
            observer_flag(&Method::POST, "/eth/v1/validator/prepare_beacon_proposer"),
            Some(PREPARE_PROPOSER_FLAG),
        );
        assert_eq!(
            observer_flag(&Method::POST, "/eth/v1/validator/beacon_committee_subscriptions"),
            Some(COMMITTEE_SUBSCRIPTION_FLAG),
        );
        assert_eq!(
            observer_flag(&Method::GET, "/eth/v1/validator/prepare_beacon_proposer"),
            None,
        );
        assert_eq!(observer_flag(&Method::POST, "/eth/v1/node/version"), None);
    }
}
