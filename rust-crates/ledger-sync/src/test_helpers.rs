use crate::{
    Error,
    Result,
    config::{
        BackoffPolicy,
        DelegationCacheConfig,
        SubscriptionConfig,
    },
    delegation_cache::DelegationCache,
    lock,
    router::{
        ConnectionRouter,
        Endpoint,
    },
    state_mirror::StateMirror,
    subscription::SubscriptionManager,
    transport::{
        EventStream,
        LedgerTransport,
        TransportEvent,
    },
    types::{
        AccountEvent,
        AccountId,
        LedgerKind,
        ProgramId,
        ReliabilityProfile,
    },
};
use futures::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicBool,
            AtomicU32,
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    time::Instant,
};

pub fn delegation_program() -> ProgramId {
    AccountId::from_label("delegation-program")
}

pub fn game_program() -> ProgramId {
    AccountId::from_label("game-program")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeProvider {
    pub profile: ReliabilityProfile,
}

/// Decrements the open-subscription counter when the stream is dropped.
struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory ledger with scriptable owners and subscriptions.
pub struct FakeLedger {
    owners: Mutex<HashMap<AccountId, ProgramId>>,
    lookups: AtomicUsize,
    failing_lookups: AtomicBool,
    lookup_gate: watch::Sender<bool>,
    open_gate: watch::Sender<bool>,
    open_failures: AtomicU32,
    open_subscriptions: Arc<AtomicUsize>,
    subscribe_calls: Mutex<Vec<(AccountId, Instant)>>,
    senders: Mutex<HashMap<AccountId, Vec<mpsc::UnboundedSender<TransportEvent>>>>,
    auto_ack: AtomicBool,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
            failing_lookups: AtomicBool::new(false),
            lookup_gate: watch::channel(true).0,
            open_gate: watch::channel(true).0,
            open_failures: AtomicU32::new(0),
            open_subscriptions: Arc::new(AtomicUsize::new(0)),
            subscribe_calls: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            auto_ack: AtomicBool::new(true),
        }
    }

    pub fn set_owner(&self, account: AccountId, owner: ProgramId) {
        lock(&self.owners).insert(account, owner);
    }

    pub fn remove_owner(&self, account: &AccountId) {
        lock(&self.owners).remove(account);
    }

    pub fn delegate(&self, account: AccountId) {
        self.set_owner(account, delegation_program());
    }

    pub fn undelegate(&self, account: AccountId) {
        self.set_owner(account, game_program());
    }

    /// Number of owner lookups started so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.failing_lookups.store(fail, Ordering::SeqCst);
    }

    /// Park owner lookups until [`Self::release_lookups`].
    pub fn hold_lookups(&self) {
        self.lookup_gate.send_replace(false);
    }

    pub fn release_lookups(&self) {
        self.lookup_gate.send_replace(true);
    }

    /// Park subscription opens until [`Self::release_opens`].
    pub fn hold_opens(&self) {
        self.open_gate.send_replace(false);
    }

    pub fn release_opens(&self) {
        self.open_gate.send_replace(true);
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.open_failures.store(count, Ordering::SeqCst);
    }

    /// Send `Acknowledged` as the first item of every new subscription.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Subscription streams currently alive.
    pub fn open_subscriptions(&self) -> usize {
        self.open_subscriptions.load(Ordering::SeqCst)
    }

    /// When each subscribe call for `account` was made, failed ones included.
    pub fn subscribe_calls(&self, account: &AccountId) -> Vec<Instant> {
        lock(&self.subscribe_calls)
            .iter()
            .filter(|(id, _)| id == account)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Deliver `event` to every live subscription of `account`. Returns how
    /// many subscriptions received it.
    pub fn push(&self, account: &AccountId, event: TransportEvent) -> usize {
        let mut senders = lock(&self.senders);
        let Some(list) = senders.get_mut(account) else {
            return 0;
        };
        list.retain(|sender| sender.send(event.clone()).is_ok());
        list.len()
    }

    pub fn push_update(&self, account: &AccountId, sequence: u64, payload: &str) -> usize {
        self.push(
            account,
            TransportEvent::Update(AccountEvent::new(
                *account,
                sequence,
                payload.as_bytes().to_vec(),
            )),
        )
    }

    /// Signal a disconnect on every live subscription of `account`.
    pub fn disconnect(&self, account: &AccountId) {
        let list = lock(&self.senders).remove(account).unwrap_or_default();
        for sender in list {
            let _ = sender.send(TransportEvent::Disconnected("connection reset".into()));
        }
    }

    async fn wait_for_gate(gate: &watch::Sender<bool>) {
        let mut receiver = gate.subscribe();
        let _ = receiver.wait_for(|open| *open).await;
    }
}

impl LedgerTransport for FakeLedger {
    type Provider = FakeProvider;

    async fn get_account_owner(&self, account: &AccountId) -> Result<Option<ProgramId>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Self::wait_for_gate(&self.lookup_gate).await;
        if self.failing_lookups.load(Ordering::SeqCst) {
            return Err(Error::Transport("owner lookup failed".into()));
        }
        Ok(lock(&self.owners).get(account).copied())
    }

    async fn subscribe_account(&self, account: &AccountId) -> Result<EventStream> {
        lock(&self.subscribe_calls).push((*account, Instant::now()));
        Self::wait_for_gate(&self.open_gate).await;
        let remaining = self.open_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.open_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport("subscription open refused".into()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        if self.auto_ack.load(Ordering::SeqCst) {
            let _ = sender.send(TransportEvent::Acknowledged);
        }
        lock(&self.senders).entry(*account).or_default().push(sender);
        self.open_subscriptions.fetch_add(1, Ordering::SeqCst);
        let guard = OpenGuard(Arc::clone(&self.open_subscriptions));

        let stream = futures::stream::unfold(
            (receiver, guard),
            |(mut receiver, guard)| async move {
                receiver.recv().await.map(|event| (event, (receiver, guard)))
            },
        );
        Ok(stream.boxed())
    }

    fn provider_for(&self, profile: &ReliabilityProfile) -> FakeProvider {
        FakeProvider { profile: *profile }
    }
}

/// Subscription settings with deterministic, short backoff.
pub fn test_subscription_config() -> SubscriptionConfig {
    SubscriptionConfig {
        open_timeout: Duration::from_secs(1),
        heartbeat_timeout: None,
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter_ratio: 0.0,
            max_attempts: Some(5),
        },
    }
}

/// Every component wired against two fake ledgers.
pub struct TestContext {
    pub base: Arc<FakeLedger>,
    pub ephemeral: Arc<FakeLedger>,
    pub cache: Arc<DelegationCache<FakeLedger>>,
    pub router: Arc<ConnectionRouter<FakeLedger>>,
    pub mirror: Arc<StateMirror>,
    pub manager: SubscriptionManager<FakeLedger>,
}

impl TestContext {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(DelegationCacheConfig::default(), test_subscription_config())
    }

    pub fn with_config(
        cache_config: DelegationCacheConfig,
        subscription_config: SubscriptionConfig,
    ) -> Self {
        let base = Arc::new(FakeLedger::new());
        let ephemeral = Arc::new(FakeLedger::new());
        let cache = Arc::new(DelegationCache::new(
            Arc::clone(&base),
            delegation_program(),
            cache_config,
        ));
        let router = Arc::new(ConnectionRouter::new(
            Arc::clone(&cache),
            Endpoint::new(LedgerKind::Base, Arc::clone(&base)),
            Endpoint::new(LedgerKind::Ephemeral, Arc::clone(&ephemeral)),
        ));
        let mirror = Arc::new(StateMirror::new());
        let manager = SubscriptionManager::new(
            Arc::clone(&router),
            Arc::clone(&mirror),
            subscription_config,
        );
        Self {
            base,
            ephemeral,
            cache,
            router,
            mirror,
            manager,
        }
    }

    /// The fake ledger for `kind`.
    pub fn ledger(&self, kind: LedgerKind) -> &Arc<FakeLedger> {
        match kind {
            LedgerKind::Base => &self.base,
            LedgerKind::Ephemeral => &self.ephemeral,
        }
    }
}

/// Poll `condition` until it holds, panicking after roughly two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
