use core::time::Duration;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use beacon_api::{BeaconEvent, BlockEvent, Error as ApiError, FinalizedCheckpointEvent, Topic};
use futures::StreamExt as _;
use log::{debug, info, warn};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use types::primitives::H256;

use crate::{block_cache::BlockCache, client::PoolClient};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(60);
const SYNC_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const EVENT_STALL_TIMEOUT: Duration = Duration::from_secs(30);
const HEAD_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(10);

impl PoolClient {
    /// Health loop for one upstream. Runs until the task is dropped;
    /// any error sends the upstream to `Offline` and retries after a delay.
    pub(crate) async fn run(self: Arc<Self>) {
        loop {
            let result = match self.bootstrap().await {
                Ok(()) => self.run_events().await,
                Err(error) => Err(error),
            };

            let Err(error) = result else {
                self.clear_retry_counter();
                return;
            };

            let (syncing, optimistic) = self.sync_flags();
            self.update_status(false, syncing, optimistic);
            self.record_error(&error);

            warn!(
                "endpoint {} error: {error:#}, retrying in {}s",
                self.name(),
                RETRY_DELAY.as_secs(),
            );

            sleep(RETRY_DELAY).await;
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        timeout(BOOTSTRAP_TIMEOUT, self.bootstrap_inner())
            .await
            .map_err(|_| anyhow!("bootstrap timed out"))?
    }

    async fn bootstrap_inner(&self) -> Result<()> {
        let version = self
            .api()
            .get_node_version()
            .await
            .context("error while fetching node version")?;

        self.set_version(version);

        let specs = self
            .api()
            .get_config_specs()
            .await
            .context("error while fetching specs")?;

        self.block_cache()?
            .set_specs(&specs)
            .context("invalid node specs")?;

        // The custody group count is a scheduling hint; nodes that do not
        // expose an identity simply advertise 0.
        match self.api().get_node_identity().await {
            Ok(identity) => self.set_custody_group_count(identity.custody_group_count()),
            Err(ApiError::NotSupported { .. }) => {}
            Err(error) => warn!(
                "endpoint {}: error while fetching node identity: {error}",
                self.name(),
            ),
        }

        self.check_sync_status().await?;

        Ok(())
    }

    async fn check_sync_status(&self) -> Result<()> {
        let status = timeout(SYNC_CHECK_TIMEOUT, self.api().get_node_syncing())
            .await
            .map_err(|_| anyhow!("sync status check timed out"))?
            .context("error while fetching synchronization status")?;

        self.update_status(self.is_online(), status.is_syncing, status.is_optimistic);

        Ok(())
    }

    async fn run_events(self: &Arc<Self>) -> Result<()> {
        self.poll_head().await?;

        let (syncing, optimistic) = self.sync_flags();

        if syncing {
            bail!("beacon node is synchronizing");
        }

        if optimistic {
            bail!("beacon node is optimistic");
        }

        let cache = self.block_cache()?;

        if let Some(specs) = cache.get_specs() {
            let (finalized_epoch, _) = cache.get_finalized();
            let finalized_slot = finalized_epoch * specs.slots_per_epoch;

            if let Some((head_slot, _)) = self.head() {
                if head_slot < finalized_slot {
                    bail!(
                        "beacon node is behind finalized checkpoint \
                         (node head: {head_slot}, finalized: {finalized_slot})"
                    );
                }
            }
        }

        self.update_status(true, syncing, optimistic);

        let mut stream = self
            .api()
            .subscribe_events(&[Topic::Block, Topic::FinalizedCheckpoint])?;

        let mut last_sync_check = Instant::now();
        let mut last_event = Instant::now();

        loop {
            tokio::select! {
                maybe_event = stream.events.next() => {
                    let event = maybe_event.ok_or_else(|| anyhow!("event stream closed"))?;

                    if let Err(error) = self.process_event(event).await {
                        warn!(
                            "endpoint {}: error processing event: {error:#}",
                            self.name(),
                        );
                    }

                    last_event = Instant::now();
                    self.touch_last_event();
                }

                maybe_ready = stream.ready.next() => {
                    let ready = maybe_ready.ok_or_else(|| anyhow!("event stream closed"))?;

                    if self.is_online() != ready {
                        let (syncing, optimistic) = self.sync_flags();
                        self.update_status(ready, syncing, optimistic);

                        if ready {
                            debug!("endpoint {}: event stream connected", self.name());
                        } else {
                            debug!("endpoint {}: event stream disconnected", self.name());
                        }
                    }
                }

                () = sleep_until(last_sync_check + SYNC_CHECK_INTERVAL) => {
                    self.check_sync_status().await?;
                    last_sync_check = Instant::now();
                }

                () = sleep_until(last_event + EVENT_STALL_TIMEOUT) => {
                    debug!(
                        "endpoint {}: no head event since {}s, polling chain head",
                        self.name(),
                        EVENT_STALL_TIMEOUT.as_secs(),
                    );

                    self.poll_head().await?;

                    last_event = Instant::now();
                    self.touch_last_event();
                }
            }
        }
    }

    async fn process_event(&self, event: BeaconEvent) -> Result<()> {
        match event {
            BeaconEvent::Block(block_event) => self.process_block_event(block_event).await,
            BeaconEvent::FinalizedCheckpoint(checkpoint_event) => {
                self.process_finalized_event(checkpoint_event)
            }
        }
    }

    async fn process_block_event(&self, event: BlockEvent) -> Result<()> {
        let cache = self.block_cache()?;
        let (block, created) = cache.add_block(event.block, event.slot);

        if let Some(block) = block {
            if created {
                info!(
                    "endpoint {}: received block {} [{:?}]",
                    self.name(),
                    event.slot,
                    event.block,
                );
            } else {
                debug!(
                    "endpoint {}: received known block {} [{:?}]",
                    self.name(),
                    event.slot,
                    event.block,
                );
            }

            block
                .ensure_header(|| async {
                    let response = timeout(
                        HEADER_FETCH_TIMEOUT,
                        self.api().get_block_header_by_root(event.block),
                    )
                    .await
                    .map_err(|_| anyhow!("header fetch timed out"))??;

                    Ok(response.header)
                })
                .await?;

            block.set_seen_by(self.index());
        }

        self.set_head(event.slot, event.block);

        Ok(())
    }

    fn process_finalized_event(&self, event: FinalizedCheckpointEvent) -> Result<()> {
        debug!(
            "endpoint {}: received finalized_checkpoint event: finalized {} [{:?}]",
            self.name(),
            event.epoch,
            event.block,
        );

        self.set_finalized_head(event.epoch, event.block);

        Ok(())
    }

    /// Fallback head refresh used before the stream is up and when it stalls.
    async fn poll_head(&self) -> Result<()> {
        timeout(HEAD_POLL_TIMEOUT, async {
            let latest = self
                .api()
                .get_latest_block_header()
                .await
                .context("could not get latest header")?;

            self.set_header(latest.root, latest.header);

            let finality = self
                .api()
                .get_finality_checkpoints()
                .await
                .context("could not get finality checkpoint")?;

            self.set_finalized_head(finality.finalized.epoch, finality.finalized.root);

            Ok(())
        })
        .await
        .map_err(|_| anyhow!("head poll timed out"))?
    }

    fn set_header(&self, root: H256, header: beacon_api::SignedBeaconBlockHeader) {
        let Ok(cache) = self.block_cache() else {
            return;
        };

        let (block, _) = cache.add_block(root, header.message.slot);

        if let Some(block) = block {
            block.set_header(header);
            block.set_seen_by(self.index());
        }

        self.set_head(header.message.slot, root);
    }

    fn block_cache(&self) -> Result<Arc<BlockCache>> {
        self.pool()
            .map(|pool| pool.block_cache.clone())
            .ok_or_else(|| anyhow!("pool was dropped"))
    }
}
