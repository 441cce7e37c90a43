use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context as _, Result};
use axum::{
    body::Body,
    http::{HeaderName, Request, Response},
};
use log::warn;
use metrics::ProxyMetrics;
use pool::{BeaconPool, ClientType, PoolClient};
use regex::Regex;
use types::ProxyConfig;

use crate::{
    auth,
    error::ProxyError,
    rebalancer,
    session::{ProxySession, SessionStore},
};

const NEXT_ENDPOINT_HEADER: HeaderName = HeaderName::from_static("x-dugtrio-next-endpoint");
const NEXT_ENDPOINT_QUERY: &str = "dugtrio-next-endpoint";
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Request ingress: path blocking, auth, sessions, endpoint choice and
/// forwarding.
pub struct BeaconProxy {
    pub(crate) config: ProxyConfig,
    pub(crate) pool: BeaconPool,
    pub(crate) metrics: Option<Arc<ProxyMetrics>>,
    pub(crate) client: reqwest::Client,
    blocked_paths: Vec<Regex>,
    pub(crate) sessions: Arc<SessionStore>,
}

impl BeaconProxy {
    pub fn new(
        config: ProxyConfig,
        pool: BeaconPool,
        metrics: Option<Arc<ProxyMetrics>>,
    ) -> Result<Arc<Self>> {
        let blocked_paths = config
            .blocked_path_patterns()
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("invalid blocked path pattern {pattern:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let sessions = Arc::new(SessionStore::new(
            config.call_rate_limit,
            config.call_rate_burst,
            config.session_timeout(),
        ));

        // Deadlines are enforced per call; the transport itself never
        // times out so SSE relays can run indefinitely.
        let client = reqwest::Client::builder().build()?;

        Ok(Arc::new(Self {
            config,
            pool,
            metrics,
            client,
            blocked_paths,
            sessions,
        }))
    }

    /// Spawns the session sweep and, when configured, the rebalancer.
    pub fn start(self: &Arc<Self>) {
        let sessions = self.sessions.clone();

        pool::spawn_supervised("proxy.session.cleanup", move || {
            sessions.clone().run_cleanup()
        });

        if let Some(interval) = self.config.rebalance_interval() {
            let proxy = self.clone();

            pool::spawn_supervised("proxy.rebalancer", move || {
                rebalancer::run_rebalancer(proxy.clone(), interval)
            });
        }
    }

    #[must_use]
    pub fn pool(&self) -> &BeaconPool {
        &self.pool
    }

    #[must_use]
    pub fn get_sessions(&self) -> Vec<Arc<ProxySession>> {
        self.sessions.get_sessions()
    }

    pub(crate) async fn process_call(
        self: &Arc<Self>,
        request: Request<Body>,
        peer: SocketAddr,
        client_type: ClientType,
    ) -> Result<Response<Body>, ProxyError> {
        if self.is_blocked_path(request.uri().path()) {
            return Err(ProxyError::PathBlocked);
        }

        let (ident, authorized) =
            auth::check_authorization(self.config.auth.as_ref(), request.headers());

        if !authorized {
            return Err(ProxyError::Unauthorized);
        }

        let session = self.get_session_for_request(&request, peer, ident.as_deref());

        if !session.check_call_limit(1.0) {
            return Err(ProxyError::CallLimitExceeded);
        }

        session.count_request();

        let endpoint = self.choose_endpoint(&request, &session, client_type)?;

        match self
            .process_proxy_call(request, peer, session, endpoint.clone())
            .await
        {
            Ok(response) => Ok(response),
            Err(error) => {
                warn!("proxy error (endpoint: {}): {error:#}", endpoint.name());
                Err(ProxyError::Internal(error))
            }
        }
    }

    /// Resolves the upstream for a request: manual override, then sticky
    /// session, then the scheduler.
    fn choose_endpoint(
        &self,
        request: &Request<Body>,
        session: &Arc<ProxySession>,
        client_type: ClientType,
    ) -> Result<Arc<PoolClient>, ProxyError> {
        if let Some(forced_type) = self.next_endpoint_override(request) {
            let requested_type = forced_type.unwrap_or(client_type);

            let endpoint = self
                .pool
                .get_ready_endpoint(requested_type, 0)
                .ok_or(ProxyError::NoEndpointAvailable)?;

            // The user asked for a different backend; drop their streams.
            session.set_last_client(endpoint.clone());

            return Ok(endpoint);
        }

        if self.config.sticky_endpoint {
            if let Some(last_client) = session.last_client() {
                if self.pool.is_client_ready(Some(&last_client))
                    && last_client.client_type().matches(client_type)
                {
                    return Ok(last_client);
                }
            }
        }

        let endpoint = self
            .pool
            .get_ready_endpoint(client_type, 0)
            .ok_or(ProxyError::NoEndpointAvailable)?;

        if self.config.sticky_endpoint {
            session.set_last_client(endpoint.clone());
        } else {
            session.record_last_client(endpoint.clone());
        }

        Ok(endpoint)
    }

    /// `X-Dugtrio-Next-Endpoint` header or `dugtrio-next-endpoint` query
    /// parameter. `Some(None)` means the override was present but did not
    /// name a known client type.
    fn next_endpoint_override(&self, request: &Request<Body>) -> Option<Option<ClientType>> {
        let name = request
            .headers()
            .get(&NEXT_ENDPOINT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .or_else(|| {
                request.uri().query()?.split('&').find_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    (key == NEXT_ENDPOINT_QUERY).then(|| value.to_owned())
                })
            })?;

        Some(name.to_lowercase().parse().ok())
    }

    fn is_blocked_path(&self, path: &str) -> bool {
        self.blocked_paths
            .iter()
            .any(|pattern| pattern.is_match(path))
    }

    fn get_session_for_request(
        &self,
        request: &Request<Body>,
        peer: SocketAddr,
        ident: Option<&str>,
    ) -> Arc<ProxySession> {
        let mut ip = String::new();

        if self.config.proxy_count > 0 {
            if let Some(forwarded) = request
                .headers()
                .get(&X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
            {
                let entries = forwarded.split(',').collect::<Vec<_>>();

                if let Some(index) = entries.len().checked_sub(self.config.proxy_count as usize) {
                    ip = entries[index].trim().to_owned();
                }
            }
        }

        if ip.is_empty() {
            ip = peer.ip().to_string();
        }

        let key = match ident {
            Some(ident) => format!("{ip}-{ident}"),
            None => ip,
        };

        self.sessions.get_session(&key)
    }
}
