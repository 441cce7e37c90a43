use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{anyhow, bail, Context as _, Result};
use axum::{
    body::Body,
    http::{
        header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
        Request, Response,
    },
};
use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt as _};
use log::{debug, warn};
use pool::PoolClient;
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::{
    beacon_proxy::BeaconProxy,
    call_context::CallContext,
    session::ProxySession,
    validator_stats::{observer_flag, ObservedBody},
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const PASSTHRU_REQUEST_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "content-type",
    "cookie",
    "referer",
    "user-agent",
    "eth-consensus-version",
    "eth-consensus-block-value",
    "eth-consensus-dependent-root",
    "eth-execution-payload-value",
    "eth-execution-payload-blinded",
];

const PASSTHRU_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "content-language",
    "content-type",
    "date",
    "etag",
    "expires",
    "last-modified",
    "location",
    "server",
    "vary",
];

const PASSTHRU_RESPONSE_HEADER_PREFIXES: &[&str] = &["eth-consensus-", "eth-execution-payload-"];

fn is_passthru_response_header(name: &HeaderName) -> bool {
    let name = name.as_str();

    PASSTHRU_RESPONSE_HEADERS.contains(&name)
        || PASSTHRU_RESPONSE_HEADER_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

impl BeaconProxy {
    /// Forwards one request to the chosen upstream and streams the response
    /// back under a sliding deadline.
    pub(crate) async fn process_proxy_call(
        self: &Arc<Self>,
        request: Request<Body>,
        peer: SocketAddr,
        session: Arc<ProxySession>,
        endpoint: Arc<PoolClient>,
    ) -> Result<Response<Body>> {
        let call_timeout = self.config.call_timeout();

        let token = tokio_util::sync::CancellationToken::new();
        let call_id = session.register_call(token.clone());

        let guard = CallGuard {
            session: session.clone(),
            call_id,
        };

        let context = CallContext::new(token, call_timeout);

        let (parts, body) = request.into_parts();

        let upstream_request = {
            let mut headers = HeaderMap::new();

            for name in PASSTHRU_REQUEST_HEADERS.iter().copied() {
                for value in parts.headers.get_all(name) {
                    headers.append(HeaderName::from_static(name), value.clone());
                }
            }

            for (name, value) in &endpoint.endpoint_config().headers {
                let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                    warn!("invalid endpoint header name {name:?}");
                    continue;
                };

                let Ok(value) = HeaderValue::from_str(value) else {
                    warn!("invalid endpoint header value for {name:?}");
                    continue;
                };

                headers.insert(name, value);
            }

            let mut forwarded_chain = parts
                .headers
                .get(&X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .map(|value| {
                    value
                        .split(", ")
                        .map(str::to_owned)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            forwarded_chain.push(peer.to_string());

            headers.insert(
                X_FORWARDED_FOR,
                HeaderValue::from_str(&forwarded_chain.join(", "))
                    .context("invalid X-Forwarded-For chain")?,
            );

            let path_and_query = parts
                .uri
                .path_and_query()
                .map(|path_and_query| path_and_query.as_str())
                .unwrap_or("/");

            let base_url = endpoint.endpoint_config().url.as_str();
            let target = format!("{}{path_and_query}", base_url.trim_end_matches('/'));
            let url = reqwest::Url::parse(&target).context("error parsing proxy url")?;

            let has_body = parts.headers.contains_key(CONTENT_LENGTH)
                || parts.headers.contains_key(TRANSFER_ENCODING);

            let mut builder = self
                .client
                .request(parts.method.clone(), url)
                .headers(headers);

            if has_body {
                let body_stream = body.into_data_stream();

                let body = match observer_flag(&parts.method, parts.uri.path()) {
                    Some(flag) => reqwest::Body::wrap_stream(ObservedBody::new(
                        body_stream,
                        session.clone(),
                        flag,
                    )),
                    None => reqwest::Body::wrap_stream(body_stream),
                };

                builder = builder.body(body);
            }

            builder.build().context("error building proxy request")?
        };

        let started = Instant::now();

        let cancellation_token = context.token();
        let upstream_response = tokio::select! {
            response = self.client.execute(upstream_request) => {
                response.context("proxy request error")?
            }

            () = cancellation_token.cancelled() => bail!("proxy call cancelled"),
        };

        let status = upstream_response.status();

        if let Some(metrics) = &self.metrics {
            metrics.add_call(
                endpoint.name(),
                &format!("{}{}", parts.method, parts.uri.path()),
                started.elapsed(),
                status.as_u16(),
            );
        }

        let is_event_stream = upstream_response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with(mime::TEXT_EVENT_STREAM.as_ref()))
            .unwrap_or(false)
            || parts.uri.path().starts_with("/eth/v1/events");

        let mut builder = Response::builder().status(status);

        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in upstream_response.headers() {
                if is_passthru_response_header(name) {
                    response_headers.append(name.clone(), value.clone());
                }
            }

            response_headers.insert(
                HeaderName::from_static("x-dugtrio-version"),
                HeaderValue::from_static(dugtrio_version::APPLICATION_NAME_AND_VERSION),
            );

            let informational = [
                ("x-dugtrio-session-ip", session.key().to_owned()),
                (
                    "x-dugtrio-session-tokens",
                    format!("{:.2}", session.limiter_tokens()),
                ),
                ("x-dugtrio-endpoint-name", endpoint.name().to_owned()),
                ("x-dugtrio-endpoint-type", endpoint.client_type().to_string()),
                ("x-dugtrio-endpoint-version", endpoint.version()),
            ];

            for (name, value) in informational {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    response_headers.insert(HeaderName::from_static(name), value);
                }
            }

            if is_event_stream {
                response_headers.insert(
                    HeaderName::from_static("x-accel-buffering"),
                    HeaderValue::from_static("no"),
                );
            }
        }

        let upstream_body = upstream_response.bytes_stream().boxed();

        let body = if is_event_stream {
            context.extend(call_timeout);

            Body::from_stream(SsePump::new(
                upstream_body,
                context,
                session.clone(),
                call_timeout,
                guard,
            ))
        } else {
            Body::from_stream(RelayBody::new(upstream_body, context, guard))
        };

        debug!(
            "proxied {} {} call (endpoint: {}, status: {status})",
            parts.method,
            parts.uri.path(),
            endpoint.name(),
        );

        builder.body(body).map_err(|error| anyhow!(error))
    }
}

/// Unregisters the call from its session when the response body is dropped.
struct CallGuard {
    session: Arc<ProxySession>,
    call_id: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.session.unregister_call(self.call_id);
    }
}

/// Plain streaming copy of an upstream response body.
/// Cancellation truncates the stream between chunks.
struct RelayBody {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    _context: CallContext,
    _guard: CallGuard,
}

impl RelayBody {
    fn new(
        upstream: BoxStream<'static, reqwest::Result<Bytes>>,
        context: CallContext,
        guard: CallGuard,
    ) -> Self {
        Self {
            upstream,
            cancelled: Box::pin(context.token().cancelled_owned()),
            _context: context,
            _guard: guard,
        }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }

        match self.upstream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(axum::Error::new(error)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Line-oriented relay for `text/event-stream` responses.
///
/// Every blank line closes an event frame; each completed frame extends the
/// call deadline and refreshes the session so active streams outlive the
/// static timeout. Cancellation is observed between frames.
struct SsePump {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    context: CallContext,
    session: Arc<ProxySession>,
    call_timeout: Duration,
    buffer: Vec<u8>,
    pending: VecDeque<Bytes>,
    _guard: CallGuard,
}

impl SsePump {
    fn new(
        upstream: BoxStream<'static, reqwest::Result<Bytes>>,
        context: CallContext,
        session: Arc<ProxySession>,
        call_timeout: Duration,
        guard: CallGuard,
    ) -> Self {
        Self {
            upstream,
            cancelled: Box::pin(context.token().cancelled_owned()),
            context,
            session,
            call_timeout,
            buffer: vec![],
            pending: VecDeque::new(),
            _guard: guard,
        }
    }

    fn split_lines(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=position).collect::<Vec<_>>();
            self.pending.push_back(Bytes::from(line));
        }
    }
}

impl Stream for SsePump {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                // A lone newline terminates the event frame.
                if line.len() == 1 && !self.context.is_cancelled() {
                    self.context.extend(self.call_timeout);
                    self.session.touch();
                }

                return Poll::Ready(Some(Ok(line)));
            }

            if self.cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(None);
            }

            match self.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.split_lines(&chunk),
                Poll::Ready(Some(Err(error))) => {
                    warn!("proxy event stream error: {error}");
                    return Poll::Ready(None);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;

    use crate::session::SessionStore;

    use super::*;

    fn byte_stream(
        chunks: Vec<&'static [u8]>,
    ) -> BoxStream<'static, reqwest::Result<Bytes>> {
        // An infallible source; reqwest errors cannot be constructed directly.
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, Infallible>(Bytes::from_static(chunk))),
        )
        .map(|result| result.map_err(|_| unreachable!()))
        .boxed()
    }

    fn pump(chunks: Vec<&'static [u8]>) -> (SsePump, tokio_util::sync::CancellationToken) {
        let session =
            SessionStore::new(0.0, 0, Duration::from_secs(600)).get_session("10.0.0.1");

        let token = tokio_util::sync::CancellationToken::new();
        let call_id = session.register_call(token.clone());

        let guard = CallGuard {
            session: session.clone(),
            call_id,
        };

        let context = CallContext::new(token.clone(), Duration::from_secs(60));

        (
            SsePump::new(byte_stream(chunks), context, session, Duration::from_secs(60), guard),
            token,
        )
    }

    #[tokio::test]
    async fn sse_pump_relays_line_by_line() {
        let (mut pump, _token) = pump(vec![b"event: head\nda", b"ta: {}\n\n"]);

        let mut lines = vec![];

        while let Some(line) = pump.next().await {
            lines.push(line.expect("relay should succeed"));
        }

        assert_eq!(
            lines,
            vec![
                Bytes::from_static(b"event: head\n"),
                Bytes::from_static(b"data: {}\n"),
                Bytes::from_static(b"\n"),
            ],
        );
    }

    #[tokio::test]
    async fn cancelled_pump_drains_buffered_lines_then_stops() {
        let (mut pump, token) = pump(vec![b"event: head\ndata: {}\n\n"]);

        // The first poll buffers the whole frame.
        assert!(pump.next().await.is_some());
        assert!(pump.next().await.is_some());

        token.cancel();

        // The buffered frame terminator still drains, then the stream ends.
        assert!(pump.next().await.is_some());
        assert!(pump.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_pump_ends_without_reading_further() {
        let (mut pump, token) = pump(vec![b"event: head\ndata: {}\n\n"]);

        token.cancel();

        assert!(pump.next().await.is_none());
    }

    #[tokio::test]
    async fn relay_body_ends_on_cancellation() {
        let session =
            SessionStore::new(0.0, 0, Duration::from_secs(600)).get_session("10.0.0.1");

        let token = tokio_util::sync::CancellationToken::new();
        let call_id = session.register_call(token.clone());

        let guard = CallGuard {
            session: session.clone(),
            call_id,
        };

        let context = CallContext::new(token.clone(), Duration::from_secs(60));

        let mut relay = RelayBody::new(
            futures::stream::pending::<reqwest::Result<Bytes>>().boxed(),
            context,
            guard,
        );

        token.cancel();

        assert!(relay.next().await.is_none());
        assert_eq!(session.active_call_count(), 1, "guard not yet dropped");

        drop(relay);
        assert_eq!(session.active_call_count(), 0);
    }

    #[test]
    fn response_allowlist_covers_wildcard_prefixes() {
        assert!(is_passthru_response_header(&HeaderName::from_static(
            "eth-consensus-version",
        )));
        assert!(is_passthru_response_header(&HeaderName::from_static(
            "eth-execution-payload-blinded",
        )));
        assert!(is_passthru_response_header(&HeaderName::from_static("content-type")));
        assert!(!is_passthru_response_header(&HeaderName::from_static(
            "x-internal-secret",
        )));
    }
}
