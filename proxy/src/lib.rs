pub use crate::{
    beacon_proxy::BeaconProxy,
    error::ProxyError,
    routing::create_router,
    session::{ProxySession, SessionStore, ValidatorSlice, ValidatorStats},
};

mod auth;
mod beacon_proxy;
mod call_context;
mod error;
mod proxy_call;
mod rate_limiter;
mod rebalancer;
mod routing;
mod session;
mod validator_stats;
