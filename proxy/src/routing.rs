use core::time::Duration;
use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use log::debug;
use pool::ClientType;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::beacon_proxy::BeaconProxy;

/// Builds the ingress router: the generic passthrough, one route per
/// client-specific prefix and the health probe.
pub fn create_router(proxy: Arc<BeaconProxy>) -> Router {
    let mut router = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/eth/*path", any(handle_generic));

    for client_type in ClientType::routable() {
        router = router.route(
            &format!("/{client_type}/*path"),
            any(handle_client_specific),
        );
    }

    // `TraceLayer` emits at DEBUG with the default target, which the
    // application filter drops. Log through `log` instead.
    router.with_state(proxy).layer(
        TraceLayer::new_for_http()
            .on_request(|request: &Request<Body>, _span: &Span| {
                debug!("received request ({} {})", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<Body>, latency: Duration, _span: &Span| {
                    debug!("produced response ({}) in {latency:?}", response.status());
                },
            ),
    )
}

async fn healthcheck(State(proxy): State<Arc<BeaconProxy>>) -> Response {
    let ready_clients = proxy
        .pool()
        .get_canonical_fork()
        .map(|fork| fork.ready_clients.len())
        .unwrap_or(0);

    if ready_clients > 0 {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no_useable_endpoint").into_response()
    }
}

async fn handle_generic(
    State(proxy): State<Arc<BeaconProxy>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    match proxy.process_call(request, peer, ClientType::Unspecified).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn handle_client_specific(
    State(proxy): State<Arc<BeaconProxy>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
) -> Response {
    let Some((client_type, remainder)) = split_client_prefix(request.uri().path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Standard endpoints served through a client-specific route lose the
    // prefix; proprietary endpoints keep their full path.
    if remainder.starts_with("eth/v") {
        let stripped = format!("/{remainder}");

        match rewrite_path(request.uri(), &stripped) {
            Ok(uri) => *request.uri_mut() = uri,
            Err(error) => {
                return (StatusCode::BAD_REQUEST, format!("invalid path: {error}"))
                    .into_response()
            }
        }
    }

    match proxy.process_call(request, peer, client_type).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

fn split_client_prefix(path: &str) -> Option<(ClientType, &str)> {
    let path = path.strip_prefix('/')?;

    let (prefix, remainder) = match path.split_once('/') {
        Some((prefix, remainder)) => (prefix, remainder),
        None => (path, ""),
    };

    let client_type = prefix.parse().ok()?;

    Some((client_type, remainder))
}

fn rewrite_path(uri: &Uri, new_path: &str) -> Result<Uri, axum::http::Error> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path.to_owned(),
    };

    Uri::builder().path_and_query(path_and_query).build()
}

#[cfg(test)]
mod tests {
    use axum::{http::header::CONTENT_TYPE, Json};
    use pool::BeaconPool;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tower::ServiceExt as _;
    use types::{EndpointConfig, PoolConfig, ProxyConfig, SchedulerMode};
    use types::primitives::H256;

    use super::*;

    fn test_request(uri: &str) -> Request<Body> {
        let mut request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("test request is valid");

        request.extensions_mut().insert(ConnectInfo::<SocketAddr>(
            "192.0.2.1:40000".parse().expect("test peer address is valid"),
        ));

        request
    }

    fn empty_pool() -> BeaconPool {
        BeaconPool::new(PoolConfig {
            follow_distance: 64,
            max_head_distance: 2,
            scheduler_mode: SchedulerMode::Rr,
        })
        .expect("pool config is valid")
    }

    fn router_with(pool: BeaconPool, config: ProxyConfig) -> Router {
        let proxy = BeaconProxy::new(config, pool, None).expect("proxy config is valid");
        create_router(proxy)
    }

    /// Serves a minimal upstream and returns its endpoint config.
    async fn spawn_fake_upstream(name: &str) -> EndpointConfig {
        let upstream = Router::new()
            .route(
                "/eth/v1/node/version",
                get(|| async { Json(json!({"data": {"version": "Lighthouse/v4.5.0"}})) }),
            )
            .route(
                "/lighthouse/health",
                get(|| async { Json(json!({"status": "ok"})) }),
            );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("binding an ephemeral port should succeed");

        let address = listener.local_addr().expect("listener has an address");

        tokio::spawn(async move {
            axum::serve(listener, upstream.into_make_service())
                .await
                .expect("fake upstream should serve");
        });

        EndpointConfig {
            url: format!("http://{address}").parse().expect("URL is valid"),
            name: name.to_owned(),
            priority: 0,
            weight: 0,
            headers: Default::default(),
        }
    }

    async fn ready_pool_with_upstreams(names: &[&str]) -> BeaconPool {
        let pool = empty_pool();

        for name in names {
            let endpoint = spawn_fake_upstream(name).await;
            let client = pool.add_endpoint(&endpoint).expect("endpoint is valid");

            client.set_version("Lighthouse/v4.5.0".to_owned());
            client.update_status(true, false, false);
            client.set_head(100, H256::repeat_byte(0xab));
        }

        pool
    }

    #[tokio::test]
    async fn healthcheck_reports_ready_and_unready_pools() {
        let router = router_with(empty_pool(), ProxyConfig::default());

        let response = router
            .oneshot(test_request("/healthcheck"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let pool = ready_pool_with_upstreams(&["node-a"]).await;
        let router = router_with(pool, ProxyConfig::default());

        let response = router
            .oneshot(test_request("/healthcheck"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn generic_requests_return_503_without_ready_endpoints() {
        let router = router_with(empty_pool(), ProxyConfig::default());

        let response = router
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn blocked_paths_return_403() {
        let router = router_with(
            empty_pool(),
            ProxyConfig {
                blocked_paths: vec!["^/eth/v1/node".to_owned()],
                ..ProxyConfig::default()
            },
        );

        let response = router
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn requests_without_credentials_are_rejected_when_auth_is_required() {
        let router = router_with(
            empty_pool(),
            ProxyConfig {
                auth: Some(types::AuthConfig {
                    required: true,
                    password: "hunter2".to_owned(),
                }),
                ..ProxyConfig::default()
            },
        );

        let response = router
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn back_to_back_requests_hit_the_rate_limit() {
        let pool = ready_pool_with_upstreams(&["node-a"]).await;

        let router = router_with(
            pool,
            ProxyConfig {
                call_rate_limit: 1.0,
                call_rate_burst: 1,
                ..ProxyConfig::default()
            },
        );

        let response = router
            .clone()
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body should be readable");

        assert_eq!(&body[..], b"Call Limit exceeded");
    }

    #[tokio::test]
    async fn round_robin_alternates_between_ready_upstreams() {
        let pool = ready_pool_with_upstreams(&["node-a", "node-b"]).await;
        let router = router_with(pool, ProxyConfig::default());

        let mut picked = vec![];

        for _ in 0..4 {
            let response = router
                .clone()
                .oneshot(test_request("/eth/v1/node/version"))
                .await
                .expect("router should respond");

            assert_eq!(response.status(), StatusCode::OK);

            picked.push(
                response
                    .headers()
                    .get("x-dugtrio-endpoint-name")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
                    .expect("endpoint name header is set"),
            );
        }

        assert_eq!(picked, ["node-a", "node-b", "node-a", "node-b"]);
    }

    #[tokio::test]
    async fn sticky_sessions_reuse_their_upstream() {
        let pool = ready_pool_with_upstreams(&["node-a", "node-b"]).await;

        let router = router_with(
            pool,
            ProxyConfig {
                sticky_endpoint: true,
                ..ProxyConfig::default()
            },
        );

        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(test_request("/eth/v1/node/version"))
                .await
                .expect("router should respond");

            assert_eq!(
                response
                    .headers()
                    .get("x-dugtrio-endpoint-name")
                    .and_then(|value| value.to_str().ok()),
                Some("node-a"),
            );
        }
    }

    #[tokio::test]
    async fn sticky_sessions_fail_over_when_their_upstream_drops() {
        let pool = ready_pool_with_upstreams(&["node-a", "node-b"]).await;

        let proxy = BeaconProxy::new(
            ProxyConfig {
                sticky_endpoint: true,
                ..ProxyConfig::default()
            },
            pool.clone(),
            None,
        )
        .expect("proxy config is valid");

        let router = create_router(proxy.clone());

        let response = router
            .clone()
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(
            response
                .headers()
                .get("x-dugtrio-endpoint-name")
                .and_then(|value| value.to_str().ok()),
            Some("node-a"),
        );

        // Track an active call on the session, then take node-a offline.
        let token = tokio_util::sync::CancellationToken::new();
        proxy.sessions.get_session("192.0.2.1").register_call(token.clone());

        pool.get_all_endpoints()[0].update_status(false, false, false);

        let response = router
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(
            response
                .headers()
                .get("x-dugtrio-endpoint-name")
                .and_then(|value| value.to_str().ok()),
            Some("node-b"),
        );

        assert!(
            token.is_cancelled(),
            "switching the sticky upstream cancels the session's active calls",
        );
    }

    #[tokio::test]
    async fn proxied_responses_carry_the_informational_headers() {
        let pool = ready_pool_with_upstreams(&["node-a"]).await;
        let router = router_with(pool, ProxyConfig::default());

        let response = router
            .oneshot(test_request("/eth/v1/node/version"))
            .await
            .expect("router should respond");

        let headers = response.headers();

        assert_eq!(
            headers.get("x-dugtrio-version").and_then(|v| v.to_str().ok()),
            Some(dugtrio_version::APPLICATION_NAME_AND_VERSION),
        );
        assert_eq!(
            headers.get("x-dugtrio-session-ip").and_then(|v| v.to_str().ok()),
            Some("192.0.2.1"),
        );
        assert!(headers.contains_key("x-dugtrio-endpoint-type"));
        assert!(headers.contains_key(CONTENT_TYPE));
    }

    #[tokio::test]
    async fn client_specific_routes_strip_the_prefix_for_standard_endpoints() {
        let pool = ready_pool_with_upstreams(&["node-a"]).await;
        let router = router_with(pool, ProxyConfig::default());

        // `/lighthouse/eth/v1/...` forwards as `/eth/v1/...`.
        let response = router
            .clone()
            .oneshot(test_request("/lighthouse/eth/v1/node/version"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::OK);

        // Proprietary paths are preserved verbatim.
        let response = router
            .oneshot(test_request("/lighthouse/health"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn client_prefixes_are_split_from_the_path() {
        assert_eq!(
            split_client_prefix("/lighthouse/eth/v1/node/version"),
            Some((ClientType::Lighthouse, "eth/v1/node/version")),
        );
        assert_eq!(
            split_client_prefix("/teku/teku/v1/admin"),
            Some((ClientType::Teku, "teku/v1/admin")),
        );
        assert_eq!(split_client_prefix("/caplin/eth/v1/x"), None);
    }
}
