use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Responses produced by the proxy itself rather than an upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Path Blocked")]
    PathBlocked,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Call Limit exceeded")]
    CallLimitExceeded,
    #[error("No Endpoint available")]
    NoEndpointAvailable,
    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    const fn status_code(&self) -> StatusCode {
        match self {
            Self::PathBlocked => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::CallLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::NoEndpointAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            [(CONTENT_TYPE, mime::TEXT_HTML.as_ref())],
            self.to_string(),
        )
            .into_response()
    }
}
