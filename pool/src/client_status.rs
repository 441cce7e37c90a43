use strum::Display;

/// Health classification of one upstream.
///
/// Only `Online` upstreams are eligible for the ready set. The syncing and
/// optimistic states take precedence over the online flag so a node that is
/// reachable but catching up is never routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ClientStatus {
    Offline,
    Online,
    Synchronizing,
    Optimistic,
}
