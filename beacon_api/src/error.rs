use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("endpoint does not support {path}")]
    NotSupported { path: String },
    #[error("unexpected status {status} for {path}")]
    UnexpectedStatus { status: StatusCode, path: String },
    #[error("request failed")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body for {path}")]
    InvalidBody {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid endpoint URL")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid static header {name:?}")]
    InvalidHeader { name: String },
}

impl Error {
    /// Transient errors keep the upstream in its retry loop.
    /// Currently every API error is treated as transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        true
    }
}
