use core::time::Duration;
use std::{collections::HashMap, sync::Arc, time::Instant};

use log::{debug, info};

use crate::{beacon_proxy::BeaconProxy, session::ProxySession};

/// Periodic redistribution of sticky sessions across the ready set.
pub(crate) async fn run_rebalancer(proxy: Arc<BeaconProxy>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        proxy.rebalance_sessions();
    }
}

impl BeaconProxy {
    pub(crate) fn rebalance_sessions(&self) {
        let Some(fork) = self.pool.get_canonical_fork() else {
            return;
        };

        let ready = &fork.ready_clients;

        if ready.len() <= 1 {
            return;
        }

        let mut assignments: HashMap<u16, Vec<Arc<ProxySession>>> = ready
            .iter()
            .map(|client| (client.index(), vec![]))
            .collect();

        for session in self.get_sessions() {
            let Some(client) = session.last_client() else {
                continue;
            };

            if let Some(bucket) = assignments.get_mut(&client.index()) {
                bucket.push(session);
            }
        }

        let total: usize = assignments.values().map(Vec::len).sum();

        if total == 0 {
            return;
        }

        let ideal = total as f64 / ready.len() as f64;
        let threshold = self.config.rebalance_threshold;
        let abs_threshold = self.config.rebalance_abs_threshold as f64;

        let needs_rebalance = |assignments: &HashMap<u16, Vec<Arc<ProxySession>>>| {
            assignments.values().any(|bucket| {
                let abs_diff = (bucket.len() as f64 - ideal).abs();
                let diff_pct = if ideal > 0.0 { abs_diff / ideal } else { 0.0 };

                diff_pct > threshold && abs_diff > abs_threshold
            })
        };

        if !needs_rebalance(&assignments) {
            return;
        }

        info!(
            "rebalancing {total} sessions across {} ready endpoints",
            ready.len(),
        );

        let max_sweep = self.config.rebalance_max_sweep;
        let mut sweeps = 0_u64;

        while needs_rebalance(&assignments) {
            let Some(most_loaded) = assignments
                .iter()
                .max_by_key(|(_, bucket)| bucket.len())
                .map(|(&index, _)| index)
            else {
                break;
            };

            let Some(least_loaded) = assignments
                .iter()
                .min_by_key(|(_, bucket)| bucket.len())
                .map(|(&index, _)| index)
            else {
                break;
            };

            if most_loaded == least_loaded {
                break;
            }

            let Some(target) = ready
                .iter()
                .find(|client| client.index() == least_loaded)
                .cloned()
            else {
                break;
            };

            // The least-recently rebalanced session moves first.
            let session = {
                let Some(bucket) = assignments.get_mut(&most_loaded) else {
                    break;
                };

                let Some(position) = bucket
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, session)| session.last_rebalance())
                    .map(|(position, _)| position)
                else {
                    break;
                };

                bucket.remove(position)
            };

            session.set_last_client(target);
            session.set_last_rebalance(Instant::now());

            if let Some(bucket) = assignments.get_mut(&least_loaded) {
                bucket.push(session);
            }

            sweeps += 1;

            if max_sweep > 0 && sweeps >= max_sweep {
                break;
            }
        }

        debug!("rebalancer moved {sweeps} sessions");
    }
}
