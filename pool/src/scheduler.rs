use std::{collections::HashMap, sync::Arc};

use crate::{client::PoolClient, client_type::ClientType};

/// Round-robin allocator over the canonical ready set.
///
/// The rotation index is partitioned by requested client type so
/// client-specific routes do not starve the default rotation.
pub(crate) struct Scheduler {
    rr_last: HashMap<ClientType, u16>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            rr_last: HashMap::new(),
        }
    }

    pub(crate) fn next(
        &mut self,
        ready_clients: &[Arc<PoolClient>],
        client_type: ClientType,
        min_custody_group_count: u16,
    ) -> Option<Arc<PoolClient>> {
        let mut survivors = ready_clients
            .iter()
            .filter(|client| {
                min_custody_group_count == 0
                    || client.custody_group_count() >= min_custody_group_count
            })
            .cloned()
            .collect::<Vec<_>>();

        survivors.sort_by_key(|client| client.index());

        let last_index = self.rr_last.get(&client_type).copied();

        let chosen = survivors
            .iter()
            .find(|client| {
                last_index.map_or(true, |last| client.index() > last)
                    && client.client_type().matches(client_type)
            })
            .or_else(|| {
                survivors
                    .iter()
                    .find(|client| client.client_type().matches(client_type))
            })?
            .clone();

        self.rr_last.insert(client_type, chosen.index());

        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use types::EndpointConfig;

    use crate::beacon_pool::BeaconPool;

    use super::*;

    fn pool_with_clients(count: usize) -> (BeaconPool, Vec<Arc<PoolClient>>) {
        let pool = BeaconPool::new(types::PoolConfig {
            follow_distance: 64,
            max_head_distance: 2,
            scheduler_mode: types::SchedulerMode::Rr,
        })
        .expect("pool config is valid");

        let clients = (0..count)
            .map(|index| {
                let endpoint = EndpointConfig {
                    url: format!("http://127.0.0.1:{}", 5052 + index)
                        .parse()
                        .expect("test URL is valid"),
                    name: format!("node-{index}"),
                    priority: 0,
                    weight: 0,
                    headers: Default::default(),
                };

                pool.add_endpoint(&endpoint).expect("endpoint is valid")
            })
            .collect();

        (pool, clients)
    }

    #[test]
    fn rotation_starts_at_the_lowest_index() {
        let (_pool, clients) = pool_with_clients(3);
        let mut scheduler = Scheduler::new();

        let picks = (0..4)
            .map(|_| {
                scheduler
                    .next(&clients, ClientType::Unspecified, 0)
                    .expect("ready clients are available")
                    .index()
            })
            .collect::<Vec<_>>();

        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn rotation_is_fair_across_requests() {
        let (_pool, clients) = pool_with_clients(3);
        let mut scheduler = Scheduler::new();

        let mut counts = [0_usize; 3];

        for _ in 0..9 {
            let index = scheduler
                .next(&clients, ClientType::Unspecified, 0)
                .expect("ready clients are available")
                .index();

            counts[usize::from(index)] += 1;
        }

        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn type_specific_requests_have_their_own_rotation() {
        let (_pool, clients) = pool_with_clients(3);

        clients[0].set_version("Lighthouse/v4.5.0".to_owned());
        clients[1].set_version("Prysm/v4.1.1".to_owned());
        clients[2].set_version("Lighthouse/v4.5.0".to_owned());

        let mut scheduler = Scheduler::new();

        assert_eq!(
            scheduler
                .next(&clients, ClientType::Lighthouse, 0)
                .map(|client| client.index()),
            Some(0),
        );

        // The default rotation is unaffected by the type-specific pick.
        assert_eq!(
            scheduler
                .next(&clients, ClientType::Unspecified, 0)
                .map(|client| client.index()),
            Some(0),
        );

        assert_eq!(
            scheduler
                .next(&clients, ClientType::Lighthouse, 0)
                .map(|client| client.index()),
            Some(2),
        );

        assert_eq!(
            scheduler
                .next(&clients, ClientType::Lighthouse, 0)
                .map(|client| client.index()),
            Some(0),
        );

        assert_eq!(
            scheduler
                .next(&clients, ClientType::Nimbus, 0)
                .map(|client| client.index()),
            None,
        );
    }

    #[test]
    fn custody_group_count_filter_excludes_clients() {
        let (_pool, clients) = pool_with_clients(2);

        clients[1].set_custody_group_count(128);

        let mut scheduler = Scheduler::new();

        for _ in 0..2 {
            assert_eq!(
                scheduler
                    .next(&clients, ClientType::Unspecified, 64)
                    .map(|client| client.index()),
                Some(1),
            );
        }
    }

    #[test]
    fn empty_ready_set_yields_none() {
        let mut scheduler = Scheduler::new();

        assert!(scheduler.next(&[], ClientType::Unspecified, 0).is_none());
    }
}
