use core::time::Duration;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use types::{
    primitives::{Epoch, Slot, H256},
    ChainConfig,
};

use crate::cached_block::CachedBlock;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot initialize block cache without follow distance")]
    ZeroFollowDistance,
    #[error("spec mismatch: {0}")]
    SpecMismatch(String),
    #[error("invalid spec values: {0}")]
    InvalidSpec(String),
}

#[derive(Default)]
struct CacheInner {
    slot_map: BTreeMap<Slot, Vec<Arc<CachedBlock>>>,
    root_map: HashMap<H256, Arc<CachedBlock>>,
    max_slot: Slot,
}

/// Slot/root-indexed ring of recently seen block headers.
///
/// Retention is bounded by the follow distance: blocks older than
/// `max_slot - follow_distance` are rejected on insert and swept out by the
/// cleanup task.
pub struct BlockCache {
    follow_distance: u64,
    specs: RwLock<Option<ChainConfig>>,
    finalized: RwLock<(Epoch, H256)>,
    cache: RwLock<CacheInner>,
}

impl BlockCache {
    pub fn new(follow_distance: u64) -> Result<Self, CacheError> {
        if follow_distance == 0 {
            return Err(CacheError::ZeroFollowDistance);
        }

        Ok(Self {
            follow_distance,
            specs: RwLock::new(None),
            finalized: RwLock::new((0, H256::zero())),
            cache: RwLock::new(CacheInner::default()),
        })
    }

    /// Merges an upstream spec response into the frozen pool spec.
    /// The first reported spec wins; later mismatches are errors.
    pub fn set_specs(&self, spec_values: &BTreeMap<String, Value>) -> Result<(), CacheError> {
        let specs = ChainConfig::from_spec_values(spec_values)
            .map_err(|error| CacheError::InvalidSpec(error.to_string()))?;

        let mut guard = self.specs.write();

        if let Some(existing) = guard.as_ref() {
            let mismatches = existing.check_mismatch(&specs);
            if !mismatches.is_empty() {
                return Err(CacheError::SpecMismatch(mismatches.join(", ")));
            }
        }

        *guard = Some(specs);

        Ok(())
    }

    #[must_use]
    pub fn get_specs(&self) -> Option<ChainConfig> {
        self.specs.read().clone()
    }

    /// Records a finalized checkpoint; older epochs are ignored.
    pub fn set_finalized(&self, epoch: Epoch, root: H256) {
        let mut guard = self.finalized.write();

        if epoch > guard.0 {
            *guard = (epoch, root);
        }
    }

    #[must_use]
    pub fn get_finalized(&self) -> (Epoch, H256) {
        *self.finalized.read()
    }

    /// Returns the cached or newly inserted block and whether it was created.
    /// Blocks below the retention floor yield `(None, false)`.
    pub fn add_block(&self, root: H256, slot: Slot) -> (Option<Arc<CachedBlock>>, bool) {
        let mut inner = self.cache.write();

        if let Some(existing) = inner.root_map.get(&root) {
            return (Some(existing.clone()), false);
        }

        if slot < inner.max_slot.saturating_sub(self.follow_distance) {
            return (None, false);
        }

        let block = Arc::new(CachedBlock::new(root, slot));

        inner.root_map.insert(root, block.clone());
        inner.slot_map.entry(slot).or_default().push(block.clone());
        inner.max_slot = inner.max_slot.max(slot);

        (Some(block), true)
    }

    #[must_use]
    pub fn get_by_root(&self, root: H256) -> Option<Arc<CachedBlock>> {
        self.cache.read().root_map.get(&root).cloned()
    }

    /// All cached blocks in descending slot order.
    #[must_use]
    pub fn cached_blocks(&self) -> Vec<Arc<CachedBlock>> {
        self.cache
            .read()
            .slot_map
            .values()
            .rev()
            .flatten()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn max_slot(&self) -> Slot {
        self.cache.read().max_slot
    }

    #[must_use]
    pub fn is_canonical(&self, block_root: H256, head_root: H256) -> bool {
        self.distance(block_root, head_root).0
    }

    /// Walks parent links from `head_root` towards `block_root`.
    ///
    /// Returns `(true, depth)` when `block_root` is an ancestor of
    /// `head_root` (same root is depth 0) and `(false, 0)` when the walk
    /// leaves the cache, runs past the target slot, or hits a missing header.
    #[must_use]
    pub fn distance(&self, block_root: H256, head_root: H256) -> (bool, u64) {
        if block_root == head_root {
            return (true, 0);
        }

        let inner = self.cache.read();

        let Some(block) = inner.root_map.get(&block_root) else {
            return (false, 0);
        };

        let block_slot = block.slot();
        let mut current = inner.root_map.get(&head_root).cloned();
        let mut depth = 0;

        while let Some(head_block) = current {
            if head_block.slot() < block_slot {
                return (false, 0);
            }

            let Some(parent_root) = head_block.parent_root() else {
                return (false, 0);
            };

            depth += 1;

            if parent_root == block_root {
                return (true, depth);
            }

            current = inner.root_map.get(&parent_root).cloned();
        }

        (false, 0)
    }

    /// Periodic retention sweep. Spawned supervised by the pool.
    pub(crate) async fn run_cleanup(self: Arc<Self>) {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        let mut inner = self.cache.write();

        if inner.max_slot <= self.follow_distance {
            return;
        }

        let min_slot = inner.max_slot - self.follow_distance;
        let retained = inner.slot_map.split_off(&min_slot);
        let expired = core::mem::replace(&mut inner.slot_map, retained);

        for block in expired.values().flatten() {
            inner.root_map.remove(&block.root());
        }
    }
}
