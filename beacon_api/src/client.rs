use core::time::Duration;
use std::collections::BTreeMap;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use types::{primitives::H256, EndpointConfig};
use url::Url;

use crate::{
    containers::{
        BlockHeaderResponse, Envelope, FinalityCheckpoints, NodeIdentity, NodeVersion, SyncStatus,
    },
    error::Error,
    events::{events_url, EventStream, Topic},
};

// The transport timeout only guards against upstreams that stop responding
// entirely. Operation deadlines are enforced by callers.
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(600);

/// Long-lived HTTP client for one upstream beacon node.
pub struct BeaconApiClient {
    client: Client,
    base_url: Url,
    name: String,
}

impl BeaconApiClient {
    pub fn new(endpoint: &EndpointConfig) -> Result<Self, Error> {
        let headers = static_headers(&endpoint.headers)?;

        let client = Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .default_headers(headers)
            .build()?;

        let mut base_url = endpoint.url.as_url().clone();

        // `Url::join` drops the last path segment unless the base ends in a
        // slash, which would silently break endpoints behind path prefixes.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        Ok(Self {
            client,
            base_url,
            name: endpoint.name.clone(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_node_version(&self) -> Result<String, Error> {
        let envelope: Envelope<NodeVersion> = self.get("eth/v1/node/version").await?;
        Ok(envelope.data.version)
    }

    pub async fn get_config_specs(&self) -> Result<BTreeMap<String, Value>, Error> {
        let envelope: Envelope<BTreeMap<String, Value>> = self.get("eth/v1/config/spec").await?;
        Ok(envelope.data)
    }

    pub async fn get_node_syncing(&self) -> Result<SyncStatus, Error> {
        let envelope: Envelope<SyncStatus> = self.get("eth/v1/node/syncing").await?;
        Ok(envelope.data)
    }

    pub async fn get_node_identity(&self) -> Result<NodeIdentity, Error> {
        let envelope: Envelope<NodeIdentity> = self.get("eth/v1/node/identity").await?;
        Ok(envelope.data)
    }

    pub async fn get_latest_block_header(&self) -> Result<BlockHeaderResponse, Error> {
        self.get_block_header("head").await
    }

    pub async fn get_block_header_by_root(
        &self,
        root: H256,
    ) -> Result<BlockHeaderResponse, Error> {
        self.get_block_header(&format!("{root:?}")).await
    }

    pub async fn get_finality_checkpoints(&self) -> Result<FinalityCheckpoints, Error> {
        let envelope: Envelope<FinalityCheckpoints> = self
            .get("eth/v1/beacon/states/head/finality_checkpoints")
            .await?;

        Ok(envelope.data)
    }

    /// Subscribes to the upstream event stream.
    /// The subscription reconnects internally and lives until dropped.
    pub fn subscribe_events(&self, topics: &[Topic]) -> Result<EventStream, Error> {
        let url = events_url(&self.base_url, topics)?;
        Ok(EventStream::spawn(self.client.clone(), url))
    }

    async fn get_block_header(&self, block_id: &str) -> Result<BlockHeaderResponse, Error> {
        let envelope: Envelope<BlockHeaderResponse> = self
            .get(&format!("eth/v1/beacon/headers/{block_id}"))
            .await?;

        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.base_url.join(path)?;
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
                return Err(Error::NotSupported {
                    path: path.to_owned(),
                })
            }
            status if !status.is_success() => {
                return Err(Error::UnexpectedStatus {
                    status,
                    path: path.to_owned(),
                })
            }
            _ => {}
        }

        let bytes = response.bytes().await?;

        serde_json::from_slice(&bytes).map_err(|source| Error::InvalidBody {
            path: path.to_owned(),
            source,
        })
    }
}

fn static_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, Error> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader { name: name.clone() })?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::InvalidHeader {
                    name: name.to_string(),
                })?;
            Ok((name, value))
        })
        .collect()
}
