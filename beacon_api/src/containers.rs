use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr};
use types::primitives::{Epoch, Slot, H256};

/// Wrapper for the `{"data": …}` envelope every standard endpoint uses.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NodeVersion {
    pub version: String,
}

#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct SyncStatus {
    #[serde_as(as = "DisplayFromStr")]
    pub head_slot: Slot,
    #[serde_as(as = "DisplayFromStr")]
    pub sync_distance: u64,
    pub is_syncing: bool,
    // Not reported by every client.
    #[serde(default)]
    pub is_optimistic: bool,
    #[serde(default)]
    pub el_offline: bool,
}

#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct BeaconBlockHeader {
    #[serde_as(as = "DisplayFromStr")]
    pub slot: Slot,
    #[serde_as(as = "DisplayFromStr")]
    pub proposer_index: u64,
    pub parent_root: H256,
    pub state_root: H256,
    pub body_root: H256,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct BlockHeaderResponse {
    pub root: H256,
    #[serde(default)]
    pub canonical: bool,
    pub header: SignedBeaconBlockHeader,
}

#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Checkpoint {
    #[serde_as(as = "DisplayFromStr")]
    pub epoch: Epoch,
    pub root: H256,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct FinalityCheckpoints {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeIdentity {
    pub peer_id: String,
    #[serde(default)]
    pub enr: String,
    #[serde(default)]
    pub p2p_addresses: Vec<String>,
    #[serde(default)]
    pub discovery_addresses: Vec<String>,
    #[serde(default)]
    pub metadata: NodeIdentityMetadata,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeIdentityMetadata {
    #[serde(default)]
    pub attnets: String,
    #[serde(default)]
    pub syncnets: String,
    // Can be a string or a number depending on the client.
    #[serde(default)]
    pub seq_number: Option<Value>,
    // MetadataV3 field advertised by Fulu-era nodes.
    #[serde(default)]
    pub custody_group_count: Option<Value>,
}

impl NodeIdentity {
    /// Custody group count with the client-dependent encoding normalized.
    /// Absent or malformed values yield 0.
    #[must_use]
    pub fn custody_group_count(&self) -> u16 {
        match &self.metadata.custody_group_count {
            Some(Value::Number(number)) => number
                .as_u64()
                .and_then(|count| count.try_into().ok())
                .unwrap_or(0),
            Some(Value::String(string)) => string.parse().unwrap_or(0),
            _ => 0,
        }
    }
}
