use core::time::Duration;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use pool::PoolClient;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use types::primitives::ValidatorIndex;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct ActiveCalls {
    next_id: u64,
    calls: HashMap<u64, CancellationToken>,
}

/// Per-identity state: rate limiter, sticky upstream, active calls and
/// observed validator indices.
pub struct ProxySession {
    key: String,
    first_seen: Instant,
    last_seen: RwLock<Instant>,
    last_rebalance: RwLock<Instant>,
    limiter: Option<Mutex<crate::rate_limiter::TokenBucket>>,
    requests: AtomicU64,
    last_client: RwLock<Option<Arc<PoolClient>>>,
    active_calls: Mutex<ActiveCalls>,
    validator_stats: RwLock<BTreeMap<ValidatorIndex, u8>>,
}

impl ProxySession {
    fn new(key: String, call_rate_limit: f64, call_rate_burst: u64) -> Self {
        let limiter = (call_rate_limit > 0.0).then(|| {
            Mutex::new(crate::rate_limiter::TokenBucket::new(
                call_rate_limit,
                call_rate_burst,
            ))
        });

        let now = Instant::now();

        Self {
            key,
            first_seen: now,
            last_seen: RwLock::new(now),
            last_rebalance: RwLock::new(now),
            limiter,
            requests: AtomicU64::new(0),
            last_client: RwLock::new(None),
            active_calls: Mutex::new(ActiveCalls::default()),
            validator_stats: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    #[must_use]
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.read()
    }

    #[must_use]
    pub fn last_rebalance(&self) -> Instant {
        *self.last_rebalance.read()
    }

    pub(crate) fn set_last_rebalance(&self, instant: Instant) {
        *self.last_rebalance.write() = instant;
    }

    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub(crate) fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn touch(&self) {
        *self.last_seen.write() = Instant::now();
    }

    /// A request costs one token. Sessions without a limiter always pass.
    pub(crate) fn check_call_limit(&self, cost: f64) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.lock().try_consume(cost),
            None => true,
        }
    }

    #[must_use]
    pub fn limiter_tokens(&self) -> f64 {
        match &self.limiter {
            Some(limiter) => limiter.lock().tokens(),
            None => 0.0,
        }
    }

    #[must_use]
    pub fn last_client(&self) -> Option<Arc<PoolClient>> {
        self.last_client.read().clone()
    }

    /// Records the routed upstream without disturbing in-flight calls.
    pub(crate) fn record_last_client(&self, client: Arc<PoolClient>) {
        *self.last_client.write() = Some(client);
    }

    /// Switches the session's upstream; a change cancels the session's
    /// active calls so long-lived streams reconnect to the new endpoint.
    pub(crate) fn set_last_client(&self, client: Arc<PoolClient>) {
        let changed = {
            let mut guard = self.last_client.write();

            let changed = guard
                .as_ref()
                .map(|current| !Arc::ptr_eq(current, &client))
                .unwrap_or(true);

            *guard = Some(client);
            changed
        };

        if changed {
            self.cancel_active_calls();
        }
    }

    pub(crate) fn register_call(&self, token: CancellationToken) -> u64 {
        let mut active = self.active_calls.lock();
        let id = active.next_id;
        active.next_id += 1;
        active.calls.insert(id, token);
        id
    }

    pub(crate) fn unregister_call(&self, id: u64) {
        self.active_calls.lock().calls.remove(&id);
    }

    pub(crate) fn cancel_active_calls(&self) {
        let mut active = self.active_calls.lock();

        for (_, token) in active.calls.drain() {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn active_call_count(&self) -> usize {
        self.active_calls.lock().calls.len()
    }

    pub(crate) fn add_validator_flags(
        &self,
        indices: impl IntoIterator<Item = ValidatorIndex>,
        flag: u8,
    ) {
        let mut stats = self.validator_stats.write();

        for index in indices {
            *stats.entry(index).or_default() |= flag;
        }
    }

    /// Run-length summary of the observed validator set.
    #[must_use]
    pub fn validator_stats(&self) -> ValidatorStats {
        let stats = self.validator_stats.read();

        let mut slices: Vec<ValidatorSlice> = vec![];

        for (&index, &flag) in stats.iter() {
            if flag == 0 {
                continue;
            }

            match slices.last_mut() {
                Some(last)
                    if last.flag == flag && last.start + u64::from(last.length) == index =>
                {
                    last.length += 1;
                }
                _ => slices.push(ValidatorSlice {
                    start: index,
                    length: 1,
                    flag,
                }),
            }
        }

        ValidatorStats {
            count: stats.len() as u64,
            validators: slices,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidatorStats {
    pub count: u64,
    pub validators: Vec<ValidatorSlice>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ValidatorSlice {
    pub start: ValidatorIndex,
    pub length: u32,
    pub flag: u8,
}

/// Keyed map of sessions with a periodic idle-eviction sweep.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<ProxySession>>>,
    call_rate_limit: f64,
    call_rate_burst: u64,
    session_timeout: Duration,
}

impl SessionStore {
    pub(crate) fn new(call_rate_limit: f64, call_rate_burst: u64, session_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            call_rate_limit,
            call_rate_burst,
            session_timeout,
        }
    }

    /// Fetches or creates the session for a derived key and refreshes its
    /// last-seen timestamp.
    pub(crate) fn get_session(&self, key: &str) -> Arc<ProxySession> {
        let mut sessions = self.sessions.lock();

        match sessions.get(key) {
            Some(session) => {
                session.touch();
                session.clone()
            }
            None => {
                let session = Arc::new(ProxySession::new(
                    key.to_owned(),
                    self.call_rate_limit,
                    self.call_rate_burst,
                ));

                sessions.insert(key.to_owned(), session.clone());
                session
            }
        }
    }

    /// All sessions ordered by first-seen time.
    #[must_use]
    pub fn get_sessions(&self) -> Vec<Arc<ProxySession>> {
        let mut sessions = self
            .sessions
            .lock()
            .values()
            .cloned()
            .collect::<Vec<_>>();

        sessions.sort_by_key(|session| session.first_seen());
        sessions
    }

    /// Idle-session sweep. Evicted sessions keep their in-flight calls;
    /// those are owned by their request handlers.
    pub(crate) async fn run_cleanup(self: Arc<Self>) {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        self.sessions
            .lock()
            .retain(|_, session| session.last_seen().elapsed() <= self.session_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_reused_per_key() {
        let store = SessionStore::new(0.0, 0, Duration::from_secs(600));

        let first = store.get_session("10.0.0.1");
        let second = store.get_session("10.0.0.1");
        let other = store.get_session("10.0.0.1-alice");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn session_without_limiter_is_never_limited() {
        let store = SessionStore::new(0.0, 0, Duration::from_secs(600));
        let session = store.get_session("10.0.0.1");

        for _ in 0..1000 {
            assert!(session.check_call_limit(1.0));
        }

        assert_eq!(session.limiter_tokens(), 0.0);
    }

    #[test]
    fn session_with_limiter_denies_past_the_burst() {
        let store = SessionStore::new(1.0, 1, Duration::from_secs(600));
        let session = store.get_session("10.0.0.1");

        assert!(session.check_call_limit(1.0));
        assert!(!session.check_call_limit(1.0));
    }

    #[test]
    fn switching_upstreams_cancels_active_calls() {
        let store = SessionStore::new(0.0, 0, Duration::from_secs(600));
        let session = store.get_session("10.0.0.1");

        let token = CancellationToken::new();
        session.register_call(token.clone());

        let (client_a, client_b) = test_clients();

        session.set_last_client(client_a.clone());
        assert!(token.is_cancelled(), "first assignment counts as a change");

        let token = CancellationToken::new();
        session.register_call(token.clone());

        session.set_last_client(client_a);
        assert!(!token.is_cancelled(), "same upstream keeps calls alive");

        session.set_last_client(client_b);
        assert!(token.is_cancelled());
        assert_eq!(session.active_call_count(), 0);
    }

    #[test]
    fn unregistered_calls_are_not_cancelled_later() {
        let store = SessionStore::new(0.0, 0, Duration::from_secs(600));
        let session = store.get_session("10.0.0.1");

        let token = CancellationToken::new();
        let id = session.register_call(token.clone());
        session.unregister_call(id);

        session.cancel_active_calls();

        assert!(!token.is_cancelled());
    }

    #[test]
    fn validator_stats_are_run_length_encoded() {
        let store = SessionStore::new(0.0, 0, Duration::from_secs(600));
        let session = store.get_session("10.0.0.1");

        session.add_validator_flags([1, 2, 3], 0x01);
        session.add_validator_flags([3, 7], 0x02);

        let stats = session.validator_stats();

        assert_eq!(stats.count, 4);
        assert_eq!(
            stats.validators,
            vec![
                ValidatorSlice { start: 1, length: 2, flag: 0x01 },
                ValidatorSlice { start: 3, length: 1, flag: 0x03 },
                ValidatorSlice { start: 7, length: 1, flag: 0x02 },
            ],
        );
    }

    #[test]
    fn cleanup_evicts_idle_sessions() {
        let store = SessionStore::new(0.0, 0, Duration::from_secs(0));

        store.get_session("10.0.0.1");
        std::thread::sleep(Duration::from_millis(5));
        store.cleanup();

        assert!(store.get_sessions().is_empty());
    }

    fn test_clients() -> (Arc<PoolClient>, Arc<PoolClient>) {
        let pool = pool::BeaconPool::new(types::PoolConfig {
            follow_distance: 64,
            max_head_distance: 2,
            scheduler_mode: types::SchedulerMode::Rr,
        })
        .expect("pool config is valid");

        let client = |index: usize| {
            pool.add_endpoint(&types::EndpointConfig {
                url: format!("http://127.0.0.1:{}", 5052 + index)
                    .parse()
                    .expect("test URL is valid"),
                name: format!("node-{index}"),
                priority: 0,
                weight: 0,
                headers: Default::default(),
            })
            .expect("endpoint is valid")
        };

        (client(0), client(1))
    }
}
