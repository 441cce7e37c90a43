pub use crate::{
    beacon_pool::BeaconPool,
    block_cache::{BlockCache, CacheError},
    cached_block::CachedBlock,
    client::PoolClient,
    client_status::ClientStatus,
    client_type::ClientType,
    forks::HeadFork,
    tasks::spawn_supervised,
};

mod beacon_pool;
mod block_cache;
mod cached_block;
mod client;
mod client_logic;
mod client_status;
mod client_type;
mod forks;
mod scheduler;
mod tasks;
