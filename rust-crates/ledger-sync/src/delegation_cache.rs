use crate::{
    Error,
    Result,
    config::DelegationCacheConfig,
    lock,
    transport::LedgerTransport,
    types::{
        AccountId,
        LedgerKind,
        ProgramId,
    },
};
use futures::{
    FutureExt,
    future::{
        BoxFuture,
        Shared,
    },
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::broadcast,
    time::Instant,
};
use tracing::{
    debug,
    info,
    warn,
};


const CHANGE_FEED_CAPACITY: usize = 64;

/// Decides which ledger an account lives on from its owning program.
pub trait DelegationClassifier: Send + Sync + 'static {
    fn classify(&self, owner: Option<&ProgramId>) -> LedgerKind;
}

/// Accounts owned by the delegation program run on the ephemeral ledger.
/// Everything else, including accounts that do not exist yet, stays on base.
#[derive(Clone, Copy, Debug)]
pub struct OwnerProgramClassifier {
    delegation_program: ProgramId,
}

impl OwnerProgramClassifier {
    pub fn new(delegation_program: ProgramId) -> Self {
        Self { delegation_program }
    }
}

impl DelegationClassifier for OwnerProgramClassifier {
    fn classify(&self, owner: Option<&ProgramId>) -> LedgerKind {
        match owner {
            Some(owner) if *owner == self.delegation_program => LedgerKind::Ephemeral,
            _ => LedgerKind::Base,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DelegationRecord {
    pub account_id: AccountId,
    pub ledger_kind: LedgerKind,
    pub observed_at: Instant,
    pub ttl: Duration,
}

impl DelegationRecord {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.observed_at) < self.ttl
    }
}

/// Emitted when a refresh finds an account on a different ledger than before.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssignmentChange {
    pub account: AccountId,
    pub previous: LedgerKind,
    pub current: LedgerKind,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<LedgerKind>>>;

struct Entry {
    record: Option<DelegationRecord>,
    invalidated: bool,
    generation: u64,
    in_flight: Option<SharedRefresh>,
    last_error: Option<Error>,
}

impl Entry {
    fn new(generation: u64) -> Self {
        Self {
            record: None,
            invalidated: false,
            generation,
            in_flight: None,
            last_error: None,
        }
    }

    /// No assignment known and no lookup running.
    fn is_vacant(&self) -> bool {
        self.record.is_none() && self.in_flight.is_none()
    }

    fn fresh_kind(&self, now: Instant) -> Option<LedgerKind> {
        if self.invalidated {
            return None;
        }
        self.record
            .filter(|record| record.is_fresh(now))
            .map(|record| record.ledger_kind)
    }
}

/// Per-account ledger assignments, refreshed from the base ledger on miss or
/// expiry with at most one lookup in flight per account.
pub struct DelegationCache<T> {
    base: Arc<T>,
    classifier: Arc<dyn DelegationClassifier>,
    config: DelegationCacheConfig,
    entries: Arc<Mutex<HashMap<AccountId, Entry>>>,
    generations: AtomicU64,
    changes: broadcast::Sender<AssignmentChange>,
}

impl<T: LedgerTransport> DelegationCache<T> {
    pub fn new(
        base: Arc<T>,
        delegation_program: ProgramId,
        config: DelegationCacheConfig,
    ) -> Self {
        Self::with_classifier(base, OwnerProgramClassifier::new(delegation_program), config)
    }

    pub fn with_classifier(
        base: Arc<T>,
        classifier: impl DelegationClassifier,
        config: DelegationCacheConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            base,
            classifier: Arc::new(classifier),
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            changes,
        }
    }

    /// The ledger `account` is assigned to.
    ///
    /// Served from cache while the record is younger than the ttl. Otherwise
    /// joins the in-flight refresh for the account or starts one. A failed
    /// refresh falls back to the last known assignment; with none, the call
    /// fails with [`Error::RoutingUnavailable`].
    pub async fn current_assignment(&self, account: &AccountId) -> Result<LedgerKind> {
        let refresh = {
            let mut entries = lock(&self.entries);
            let entry = entries
                .entry(*account)
                .or_insert_with(|| Entry::new(self.next_generation()));
            if let Some(kind) = entry.fresh_kind(Instant::now()) {
                debug!(account = %account, ledger = %kind, "delegation cache hit");
                return Ok(kind);
            }
            match &entry.in_flight {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = self.start_refresh(*account, entry.generation);
                    entry.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    /// Force the next [`Self::current_assignment`] to refresh. Any refresh
    /// already in flight is detached and will not update the cache.
    pub fn invalidate(&self, account: &AccountId) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(account) else {
            return;
        };
        entry.invalidated = true;
        entry.generation = self.next_generation();
        entry.in_flight = None;
        debug!(account = %account, "delegation record invalidated");
        if entry.is_vacant() {
            entries.remove(account);
        }
    }

    pub fn record(&self, account: &AccountId) -> Option<DelegationRecord> {
        lock(&self.entries).get(account).and_then(|entry| entry.record)
    }

    /// Last known assignment, fresh or not. Never triggers a lookup.
    pub fn cached_assignment(&self, account: &AccountId) -> Option<LedgerKind> {
        self.record(account).map(|record| record.ledger_kind)
    }

    /// The error of the most recent failed refresh, cleared by a successful one.
    ///
    /// Only accounts with a known assignment keep an error. A lookup that
    /// fails with nothing to fall back on reports through
    /// [`Error::RoutingUnavailable`] and leaves no trace in the cache.
    pub fn last_error(&self, account: &AccountId) -> Option<Error> {
        lock(&self.entries)
            .get(account)
            .and_then(|entry| entry.last_error.clone())
    }

    pub fn changes(&self) -> broadcast::Receiver<AssignmentChange> {
        self.changes.subscribe()
    }

    pub fn config(&self) -> &DelegationCacheConfig {
        &self.config
    }

    /// Accounts holding an assignment or a lookup in flight.
    pub fn tracked_accounts(&self) -> usize {
        lock(&self.entries).len()
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn start_refresh(&self, account: AccountId, generation: u64) -> SharedRefresh {
        let base = Arc::clone(&self.base);
        let classifier = Arc::clone(&self.classifier);
        let entries = Arc::clone(&self.entries);
        let changes = self.changes.clone();
        let config = self.config;

        async move {
            debug!(account = %account, "refreshing delegation record");
            let lookup =
                tokio::time::timeout(config.refresh_timeout, base.get_account_owner(&account))
                    .await;
            let observed = match lookup {
                Ok(Ok(owner)) => Ok(classifier.classify(owner.as_ref())),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::Timeout {
                    operation: "delegation refresh",
                    after: config.refresh_timeout,
                }),
            };

            let mut entries = lock(&entries);
            let Some(entry) = entries.get_mut(&account) else {
                debug!(account = %account, "delegation record dropped during refresh");
                return observed.map_err(|err| unavailable(account, &err));
            };
            let current = entry.generation == generation;
            if current {
                entry.in_flight = None;
            }
            let outcome = match observed {
                Ok(kind) => {
                    if current {
                        let previous = entry.record.map(|record| record.ledger_kind);
                        entry.record = Some(DelegationRecord {
                            account_id: account,
                            ledger_kind: kind,
                            observed_at: Instant::now(),
                            ttl: config.ttl,
                        });
                        entry.invalidated = false;
                        entry.last_error = None;
                        if let Some(previous) = previous.filter(|previous| *previous != kind) {
                            info!(
                                account = %account,
                                from = %previous,
                                to = %kind,
                                "delegation assignment changed"
                            );
                            let _ = changes.send(AssignmentChange {
                                account,
                                previous,
                                current: kind,
                            });
                        }
                    }
                    Ok(kind)
                }
                Err(err) => match entry.record {
                    Some(record) => {
                        warn!(
                            account = %account,
                            ledger = %record.ledger_kind,
                            %err,
                            "delegation refresh failed; serving last known assignment"
                        );
                        if current {
                            entry.last_error = Some(err);
                        }
                        Ok(record.ledger_kind)
                    }
                    None => {
                        warn!(account = %account, %err, "delegation refresh failed");
                        Err(unavailable(account, &err))
                    }
                },
            };
            if entry.is_vacant() {
                entries.remove(&account);
            }
            outcome
        }
        .boxed()
        .shared()
    }
}

fn unavailable(account: AccountId, cause: &Error) -> Error {
    Error::RoutingUnavailable {
        account,
        reason: cause.to_string(),
    }
}
