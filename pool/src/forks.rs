use std::sync::Arc;

use types::primitives::{Slot, H256};

use crate::{beacon_pool::PoolInner, client::PoolClient, client_status::ClientStatus};

/// A set of upstreams whose heads are equal or lie on one ancestor chain,
/// represented by the most advanced head among them.
pub struct HeadFork {
    pub slot: Slot,
    pub root: H256,
    pub all_clients: Vec<Arc<PoolClient>>,
    pub ready_clients: Vec<Arc<PoolClient>>,
}

impl HeadFork {
    #[must_use]
    pub fn is_client_ready(&self, client: &PoolClient) -> bool {
        self.ready_clients
            .iter()
            .any(|ready| ready.index() == client.index())
    }
}

struct ForkBuilder {
    slot: Slot,
    root: H256,
    clients: Vec<Arc<PoolClient>>,
}

impl PoolInner {
    /// Groups upstreams into head forks and ranks them by ready-client
    /// count. Callers memoize the result in the fork cache.
    pub(crate) fn compute_head_forks(&self) -> Vec<Arc<HeadFork>> {
        let clients = self.clients.read().clone();
        let mut builders: Vec<ForkBuilder> = vec![];

        for client in &clients {
            let Some((head_slot, head_root)) = client.head() else {
                continue;
            };

            let matching = builders.iter_mut().position(|builder| {
                if builder.root == head_root
                    || self.block_cache.is_canonical(head_root, builder.root)
                {
                    return true;
                }

                // The client is ahead of the fork representative: the fork
                // is promoted to the more advanced head.
                if self.block_cache.is_canonical(builder.root, head_root) {
                    builder.root = head_root;
                    builder.slot = head_slot;
                    return true;
                }

                false
            });

            match matching {
                Some(position) => builders[position].clients.push(client.clone()),
                None => builders.push(ForkBuilder {
                    slot: head_slot,
                    root: head_root,
                    clients: vec![client.clone()],
                }),
            }
        }

        let max_head_distance = self.config.max_head_distance;

        let mut forks = builders
            .into_iter()
            .map(|builder| {
                let ready_clients = builder
                    .clients
                    .iter()
                    .filter(|client| {
                        if client.status() != ClientStatus::Online {
                            return false;
                        }

                        let Some((_, client_root)) = client.head() else {
                            return false;
                        };

                        if client_root == builder.root {
                            return true;
                        }

                        let (_, distance) = self.block_cache.distance(client_root, builder.root);
                        distance < max_head_distance
                    })
                    .cloned()
                    .collect::<Vec<_>>();

                Arc::new(HeadFork {
                    slot: builder.slot,
                    root: builder.root,
                    all_clients: builder.clients,
                    ready_clients,
                })
            })
            .collect::<Vec<_>>();

        // Stable sort keeps first-appearance order on ties.
        forks.sort_by_key(|fork| core::cmp::Reverse(fork.ready_clients.len()));

        forks
    }
}
