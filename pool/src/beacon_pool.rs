use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use types::{EndpointConfig, PoolConfig};

use crate::{
    block_cache::BlockCache,
    client::PoolClient,
    client_status::ClientStatus,
    client_type::ClientType,
    forks::HeadFork,
    scheduler::Scheduler,
    tasks,
};

/// Aggregates the upstream clients and exposes the canonical ready set.
#[derive(Clone)]
pub struct BeaconPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) block_cache: Arc<BlockCache>,
    pub(crate) clients: RwLock<Vec<Arc<PoolClient>>>,
    client_counter: Mutex<u16>,
    fork_cache: Mutex<Option<Vec<Arc<HeadFork>>>>,
    scheduler: Mutex<Scheduler>,
}

impl BeaconPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let block_cache = Arc::new(BlockCache::new(config.follow_distance)?);

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                block_cache,
                clients: RwLock::new(vec![]),
                client_counter: Mutex::new(0),
                fork_cache: Mutex::new(None),
                scheduler: Mutex::new(Scheduler::new()),
            }),
        })
    }

    /// Registers an upstream. Health loops start with [`BeaconPool::start`].
    pub fn add_endpoint(&self, endpoint: &EndpointConfig) -> Result<Arc<PoolClient>> {
        let index = {
            let mut counter = self.inner.client_counter.lock();
            let index = *counter;
            *counter += 1;
            index
        };

        let client = PoolClient::new(Arc::downgrade(&self.inner), index, endpoint.clone())?;

        self.inner.clients.write().push(client.clone());
        self.inner.update_log_metrics();

        Ok(client)
    }

    /// Spawns the per-upstream health loops and the block cache sweep.
    pub fn start(&self) {
        let block_cache = self.inner.block_cache.clone();

        tasks::spawn_supervised("pool.blockcache.cleanup", move || {
            block_cache.clone().run_cleanup()
        });

        for client in self.inner.clients.read().iter() {
            let client = client.clone();
            tasks::spawn_supervised("pool.client", move || client.clone().run());
        }
    }

    #[must_use]
    pub fn get_all_endpoints(&self) -> Vec<Arc<PoolClient>> {
        self.inner.clients.read().clone()
    }

    #[must_use]
    pub fn block_cache(&self) -> Arc<BlockCache> {
        self.inner.block_cache.clone()
    }

    #[must_use]
    pub fn get_head_forks(&self) -> Vec<Arc<HeadFork>> {
        self.inner.get_head_forks()
    }

    #[must_use]
    pub fn get_canonical_fork(&self) -> Option<Arc<HeadFork>> {
        self.get_head_forks().first().cloned()
    }

    /// Whether the client is part of the canonical ready set.
    #[must_use]
    pub fn is_client_ready(&self, client: Option<&Arc<PoolClient>>) -> bool {
        let Some(client) = client else {
            return false;
        };

        self.get_canonical_fork()
            .map(|fork| fork.is_client_ready(client))
            .unwrap_or(false)
    }

    /// Picks the next ready upstream for the requested client type.
    #[must_use]
    pub fn get_ready_endpoint(
        &self,
        client_type: ClientType,
        min_custody_group_count: u16,
    ) -> Option<Arc<PoolClient>> {
        let fork = self.get_canonical_fork()?;

        if fork.ready_clients.is_empty() {
            return None;
        }

        self.inner
            .scheduler
            .lock()
            .next(&fork.ready_clients, client_type, min_custody_group_count)
    }
}

impl PoolInner {
    pub(crate) fn get_head_forks(&self) -> Vec<Arc<HeadFork>> {
        let mut cache = self.fork_cache.lock();

        if let Some(forks) = cache.as_ref() {
            return forks.clone();
        }

        let forks = self.compute_head_forks();
        *cache = Some(forks.clone());

        forks
    }

    pub(crate) fn invalidate_fork_cache(&self) {
        *self.fork_cache.lock() = None;
    }

    pub(crate) fn update_log_metrics(&self) {
        let clients = self.clients.read();

        let online = clients
            .iter()
            .filter(|client| client.status() == ClientStatus::Online)
            .count();

        logging::ENDPOINT_LOG_METRICS.set_ready_endpoint_count(online);
        logging::ENDPOINT_LOG_METRICS.set_total_endpoint_count(clients.len());
    }
}
