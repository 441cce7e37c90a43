use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use beacon_api::BeaconApiClient;
use logging::info_with_endpoints;
use parking_lot::{Mutex, RwLock};
use types::{
    primitives::{Epoch, Slot, H256},
    EndpointConfig,
};

use crate::{beacon_pool::PoolInner, client_status::ClientStatus, client_type::ClientType};

#[derive(Clone, Copy, Default)]
struct StatusFlags {
    online: bool,
    syncing: bool,
    optimistic: bool,
}

impl StatusFlags {
    fn status(self) -> ClientStatus {
        if self.syncing {
            ClientStatus::Synchronizing
        } else if self.optimistic {
            ClientStatus::Optimistic
        } else if self.online {
            ClientStatus::Online
        } else {
            ClientStatus::Offline
        }
    }
}

/// One upstream beacon node tracked by the pool.
pub struct PoolClient {
    index: u16,
    endpoint: EndpointConfig,
    api: BeaconApiClient,
    pool: Weak<PoolInner>,
    flags: Mutex<StatusFlags>,
    version: RwLock<String>,
    client_type: RwLock<ClientType>,
    custody_group_count: AtomicU16,
    head: RwLock<Option<(Slot, H256)>>,
    finalized: RwLock<(Epoch, H256)>,
    last_error: RwLock<Option<String>>,
    last_event: RwLock<Instant>,
    retry_counter: AtomicU64,
}

impl PoolClient {
    pub(crate) fn new(
        pool: Weak<PoolInner>,
        index: u16,
        endpoint: EndpointConfig,
    ) -> Result<Arc<Self>, beacon_api::Error> {
        let api = BeaconApiClient::new(&endpoint)?;

        Ok(Arc::new(Self {
            index,
            endpoint,
            api,
            pool,
            flags: Mutex::new(StatusFlags::default()),
            version: RwLock::new(String::new()),
            client_type: RwLock::new(ClientType::Unknown),
            custody_group_count: AtomicU16::new(0),
            head: RwLock::new(None),
            finalized: RwLock::new((0, H256::zero())),
            last_error: RwLock::new(None),
            last_event: RwLock::new(Instant::now()),
            retry_counter: AtomicU64::new(0),
        }))
    }

    #[must_use]
    pub const fn index(&self) -> u16 {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    #[must_use]
    pub const fn endpoint_config(&self) -> &EndpointConfig {
        &self.endpoint
    }

    #[must_use]
    pub fn version(&self) -> String {
        self.version.read().clone()
    }

    #[must_use]
    pub fn client_type(&self) -> ClientType {
        *self.client_type.read()
    }

    #[must_use]
    pub fn custody_group_count(&self) -> u16 {
        self.custody_group_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.flags.lock().status()
    }

    #[must_use]
    pub fn head(&self) -> Option<(Slot, H256)> {
        *self.head.read()
    }

    #[must_use]
    pub fn finalized(&self) -> (Epoch, H256) {
        *self.finalized.read()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    #[must_use]
    pub fn last_event_time(&self) -> Instant {
        *self.last_event.read()
    }

    #[must_use]
    pub fn retry_counter(&self) -> u64 {
        self.retry_counter.load(Ordering::Relaxed)
    }

    pub(crate) const fn api(&self) -> &BeaconApiClient {
        &self.api
    }

    pub(crate) fn pool(&self) -> Option<Arc<PoolInner>> {
        self.pool.upgrade()
    }

    /// Records the advertised node version and re-derives the client type.
    /// Driven by the health loop.
    pub fn set_version(&self, version: String) {
        *self.client_type.write() = ClientType::from_version(&version);
        *self.version.write() = version;
    }

    pub fn set_custody_group_count(&self, count: u16) {
        self.custody_group_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn touch_last_event(&self) {
        *self.last_event.write() = Instant::now();
    }

    pub(crate) fn record_error(&self, error: &anyhow::Error) {
        *self.last_error.write() = Some(format!("{error:#}"));
        self.retry_counter.fetch_add(1, Ordering::Relaxed);
        self.touch_last_event();
    }

    pub(crate) fn clear_retry_counter(&self) {
        self.retry_counter.store(0, Ordering::Relaxed);
    }

    pub(crate) fn is_online(&self) -> bool {
        self.flags.lock().online
    }

    pub(crate) fn sync_flags(&self) -> (bool, bool) {
        let flags = self.flags.lock();
        (flags.syncing, flags.optimistic)
    }

    /// Applies new health flags. A status transition invalidates the fork
    /// cache. Driven by the health loop.
    pub fn update_status(&self, online: bool, syncing: bool, optimistic: bool) {
        let (old_status, new_status) = {
            let mut flags = self.flags.lock();
            let old_status = flags.status();

            *flags = StatusFlags {
                online,
                syncing,
                optimistic,
            };

            (old_status, flags.status())
        };

        if old_status != new_status {
            info_with_endpoints!(
                "endpoint {} status changed  {old_status} -> {new_status}",
                self.name(),
            );

            if let Some(pool) = self.pool.upgrade() {
                pool.invalidate_fork_cache();
                pool.update_log_metrics();
            }
        }
    }

    /// Updates the local head; a repeated root is a no-op that keeps the
    /// fork cache warm.
    pub fn set_head(&self, slot: Slot, root: H256) {
        {
            let mut head = self.head.write();

            if head.map(|(_, head_root)| head_root) == Some(root) {
                return;
            }

            *head = Some((slot, root));
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.invalidate_fork_cache();
        }
    }

    /// Records a finalized checkpoint for this upstream and forwards it to
    /// the block cache. A repeated root skips the local update; the head
    /// lock is scoped so it is released on every path.
    pub fn set_finalized_head(&self, epoch: Epoch, root: H256) {
        {
            let mut finalized = self.finalized.write();

            if finalized.1 != root {
                *finalized = (epoch, root);
            }
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.block_cache.set_finalized(epoch, root);
        }
    }
}
