use std::collections::BTreeSet;

use anyhow::Result;
use beacon_api::SignedBeaconBlockHeader;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use types::primitives::{Slot, H256};

/// A block observed on at least one upstream.
///
/// The root and slot are fixed at insertion. The header is filled in lazily
/// (single writer); the seen-by set only grows.
pub struct CachedBlock {
    root: H256,
    slot: Slot,
    header: RwLock<Option<SignedBeaconBlockHeader>>,
    header_fill: Mutex<()>,
    seen_by: RwLock<BTreeSet<u16>>,
}

impl CachedBlock {
    pub(crate) fn new(root: H256, slot: Slot) -> Self {
        Self {
            root,
            slot,
            header: RwLock::new(None),
            header_fill: Mutex::new(()),
            seen_by: RwLock::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub const fn root(&self) -> H256 {
        self.root
    }

    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.slot
    }

    #[must_use]
    pub fn header(&self) -> Option<SignedBeaconBlockHeader> {
        *self.header.read()
    }

    #[must_use]
    pub fn parent_root(&self) -> Option<H256> {
        self.header
            .read()
            .as_ref()
            .map(|header| header.message.parent_root)
    }

    pub fn set_header(&self, header: SignedBeaconBlockHeader) {
        *self.header.write() = Some(header);
    }

    /// Upstream indices that observed this block, in ascending order.
    #[must_use]
    pub fn seen_by(&self) -> Vec<u16> {
        self.seen_by.read().iter().copied().collect()
    }

    pub fn set_seen_by(&self, client_index: u16) {
        self.seen_by.write().insert(client_index);
    }

    /// Loads the header unless it is already present.
    /// Concurrent loaders are serialized; only the first one hits the network.
    pub async fn ensure_header<F, Fut>(&self, load_header: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: core::future::Future<Output = Result<SignedBeaconBlockHeader>>,
    {
        if self.header.read().is_some() {
            return Ok(());
        }

        let _guard = self.header_fill.lock().await;

        if self.header.read().is_some() {
            return Ok(());
        }

        let header = load_header().await?;
        *self.header.write() = Some(header);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use beacon_api::BlockHeaderResponse;

    use super::*;

    fn header(slot: Slot, parent_root: H256) -> SignedBeaconBlockHeader {
        serde_json::from_value::<BlockHeaderResponse>(serde_json::json!({
            "root": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "header": {
                "message": {
                    "slot": slot.to_string(),
                    "proposer_index": "0",
                    "parent_root": format!("{parent_root:?}"),
                    "state_root": "0x0000000000000000000000000000000000000000000000000000000000000000",
                    "body_root": "0x0000000000000000000000000000000000000000000000000000000000000000",
                },
            },
        }))
        .expect("test header should deserialize")
        .header
    }

    #[tokio::test]
    async fn ensure_header_loads_once() -> Result<()> {
        let block = CachedBlock::new(H256::repeat_byte(1), 10);
        let load_count = AtomicUsize::new(0);

        for _ in 0..3 {
            block
                .ensure_header(|| async {
                    load_count.fetch_add(1, Ordering::Relaxed);
                    Ok(header(10, H256::repeat_byte(2)))
                })
                .await?;
        }

        assert_eq!(load_count.load(Ordering::Relaxed), 1);
        assert_eq!(block.parent_root(), Some(H256::repeat_byte(2)));

        Ok(())
    }

    #[test]
    fn seen_by_grows_and_stays_sorted() {
        let block = CachedBlock::new(H256::repeat_byte(1), 10);

        block.set_seen_by(2);
        block.set_seen_by(0);
        block.set_seen_by(2);

        assert_eq!(block.seen_by(), vec![0, 2]);
    }
}
