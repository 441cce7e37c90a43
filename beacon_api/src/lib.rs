pub use crate::{
    client::BeaconApiClient,
    containers::{
        BlockHeaderResponse, Checkpoint, FinalityCheckpoints, NodeIdentity, SignedBeaconBlockHeader,
        SyncStatus,
    },
    error::Error,
    events::{BeaconEvent, BlockEvent, EventStream, FinalizedCheckpointEvent, Topic},
};

mod client;
mod containers;
mod error;
mod events;
mod sse;
