use crate::{
    Error,
    Result,
    config::SubscriptionConfig,
    delegation_cache::AssignmentChange,
    lock,
    router::ConnectionRouter,
    state_mirror::{
        ApplyOutcome,
        StateMirror,
    },
    transport::{
        EventStream,
        LedgerTransport,
        TransportEvent,
    },
    types::{
        AccountEvent,
        AccountId,
        Intent,
        LedgerKind,
    },
};
use futures::{
    FutureExt,
    StreamExt,
    stream::BoxStream,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        Weak,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
};
use tokio::{
    sync::{
        broadcast::{
            self,
            error::RecvError,
        },
        mpsc,
        watch,
    },
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{
    debug,
    info,
    warn,
};

pub mod backoff;


use backoff::Backoff;

/// Upper bound on buffered transport items folded into one delivery before
/// the worker yields.
const MAX_COALESCED: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Unwatched,
    RetriesExhausted(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Live,
    /// Waiting out backoff after `attempt` consecutive failures.
    Reconnecting { attempt: u32 },
    Closed { reason: CloseReason },
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed { .. })
    }
}

/// Observable state of one watched account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleStatus {
    pub state: ConnectionState,
    pub endpoint_kind: Option<LedgerKind>,
    pub last_seen_sequence: Option<u64>,
}

impl HandleStatus {
    fn idle() -> Self {
        Self {
            state: ConnectionState::Idle,
            endpoint_kind: None,
            last_seen_sequence: None,
        }
    }
}

/// A read-only view of a watched account's subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    account_id: AccountId,
    status: watch::Receiver<HandleStatus>,
}

impl SubscriptionHandle {
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn status(&self) -> HandleStatus {
        self.status.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.borrow().state.clone()
    }

    pub fn endpoint_kind(&self) -> Option<LedgerKind> {
        self.status.borrow().endpoint_kind
    }

    pub fn last_seen_sequence(&self) -> Option<u64> {
        self.status.borrow().last_seen_sequence
    }

    /// Resolve once the status satisfies `predicate`, or with the final
    /// status if the subscription goes away first.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&HandleStatus) -> bool,
    ) -> HandleStatus {
        let mut status = self.status.clone();
        if let Ok(current) = status.wait_for(|current| predicate(current)).await {
            return current.clone();
        }
        status.borrow().clone()
    }

    /// Status changes, starting with the current one.
    pub fn changes(&self) -> BoxStream<'static, HandleStatus> {
        WatchStream::new(self.status.clone()).boxed()
    }
}

enum Command {
    Resubscribe,
    Shutdown,
}

struct Watch {
    handle: SubscriptionHandle,
    status: Arc<watch::Sender<HandleStatus>>,
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Watch {
    fn is_finished(&self) -> bool {
        self.status.borrow().state.is_closed()
    }

    fn resubscribe(&self) {
        let _ = self.commands.send(Command::Resubscribe);
    }

    /// Stop the worker and wait until its subscription is released.
    async fn close(self) {
        let account = self.handle.account_id;
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Shutdown);
        if let Err(err) = self.task.await {
            warn!(account = %account, ?err, "subscription worker ended abnormally");
        }
        self.status.send_if_modified(|status| {
            if status.state.is_closed() {
                return false;
            }
            status.state = ConnectionState::Closed {
                reason: CloseReason::Unwatched,
            };
            true
        });
    }
}

type Watches = Arc<Mutex<HashMap<AccountId, Watch>>>;

/// Keeps one push subscription per watched account on the ledger that
/// currently owns it, feeding updates into the [`StateMirror`].
pub struct SubscriptionManager<T: LedgerTransport> {
    router: Arc<ConnectionRouter<T>>,
    mirror: Arc<StateMirror>,
    config: SubscriptionConfig,
    watches: Watches,
    monitor: JoinHandle<()>,
}

impl<T: LedgerTransport> SubscriptionManager<T> {
    /// Must be called from within a tokio runtime: the manager spawns a task
    /// following delegation changes.
    pub fn new(
        router: Arc<ConnectionRouter<T>>,
        mirror: Arc<StateMirror>,
        config: SubscriptionConfig,
    ) -> Self {
        let watches: Watches = Arc::new(Mutex::new(HashMap::new()));
        let monitor = tokio::spawn(follow_assignments(
            Arc::clone(&router),
            router.cache().changes(),
            Arc::downgrade(&watches),
        ));
        Self {
            router,
            mirror,
            config,
            watches,
            monitor,
        }
    }

    /// Start watching `account`. Watching an account that is already watched
    /// returns the existing handle.
    pub fn watch(&self, account: AccountId) -> SubscriptionHandle {
        let mut watches = lock(&self.watches);
        if let Some(existing) = watches.get(&account)
            && !existing.is_finished()
        {
            return existing.handle.clone();
        }

        let (status_tx, status_rx) = watch::channel(HandleStatus::idle());
        let status = Arc::new(status_tx);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            account,
            router: Arc::clone(&self.router),
            mirror: Arc::clone(&self.mirror),
            config: self.config,
            status: Arc::clone(&status),
            closed: Arc::clone(&closed),
        };
        let task = tokio::spawn(worker.run(commands_rx));
        let handle = SubscriptionHandle {
            account_id: account,
            status: status_rx,
        };
        watches.insert(
            account,
            Watch {
                handle: handle.clone(),
                status,
                commands: commands_tx,
                closed,
                task,
            },
        );
        debug!(account = %account, "watching account");
        handle
    }

    /// Stop watching `account`. Returns once the subscription is released,
    /// including when an open attempt was still in flight.
    pub async fn unwatch(&self, account: &AccountId) {
        let removed = lock(&self.watches).remove(account);
        if let Some(watch) = removed {
            watch.close().await;
            debug!(account = %account, "unwatched account");
        }
    }

    pub fn handle(&self, account: &AccountId) -> Option<SubscriptionHandle> {
        lock(&self.watches)
            .get(account)
            .map(|watch| watch.handle.clone())
    }

    pub fn state(&self, account: &AccountId) -> Option<ConnectionState> {
        self.handle(account).map(|handle| handle.connection_state())
    }

    pub fn watched(&self) -> Vec<AccountId> {
        lock(&self.watches).keys().copied().collect()
    }

    /// Unwatch every account and wait for all workers to finish.
    pub async fn shutdown(self) {
        let drained: Vec<Watch> = lock(&self.watches).drain().map(|(_, w)| w).collect();
        for watch in drained {
            watch.close().await;
        }
        self.monitor.abort();
    }
}

impl<T: LedgerTransport> Drop for SubscriptionManager<T> {
    fn drop(&mut self) {
        self.monitor.abort();
        for watch in lock(&self.watches).values() {
            watch.closed.store(true, Ordering::SeqCst);
            let _ = watch.commands.send(Command::Shutdown);
        }
    }
}

/// Reopen subscriptions whose account moved to another ledger.
async fn follow_assignments<T: LedgerTransport>(
    router: Arc<ConnectionRouter<T>>,
    mut changes: broadcast::Receiver<AssignmentChange>,
    watches: Weak<Mutex<HashMap<AccountId, Watch>>>,
) {
    loop {
        let received = changes.recv().await;
        let Some(active) = watches.upgrade() else {
            break;
        };
        match received {
            Ok(change) => {
                if let Some(watch) = lock(&active).get(&change.account)
                    && watch.handle.endpoint_kind() != Some(change.current)
                {
                    info!(
                        account = %change.account,
                        to = %change.current,
                        "delegation changed; reopening subscription"
                    );
                    watch.resubscribe();
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "delegation change feed lagged; reconciling all watches");
                for (account, watch) in lock(&active).iter() {
                    let cached = router.cache().cached_assignment(account);
                    if cached.is_some() && watch.handle.endpoint_kind() != cached {
                        watch.resubscribe();
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

enum Exit {
    Shutdown,
    Resubscribe,
    Disrupted(String),
}

impl Exit {
    fn from_command(command: Option<Command>) -> Self {
        match command {
            Some(Command::Resubscribe) => Exit::Resubscribe,
            Some(Command::Shutdown) | None => Exit::Shutdown,
        }
    }
}

/// Highest-sequence event not yet handed to the mirror.
#[derive(Default)]
struct PendingEvent(Option<AccountEvent>);

impl PendingEvent {
    fn offer(&mut self, event: AccountEvent) {
        match &self.0 {
            Some(pending) if pending.sequence >= event.sequence => {}
            _ => self.0 = Some(event),
        }
    }

    fn take(&mut self) -> Option<AccountEvent> {
        self.0.take()
    }
}

struct Worker<T> {
    account: AccountId,
    router: Arc<ConnectionRouter<T>>,
    mirror: Arc<StateMirror>,
    config: SubscriptionConfig,
    status: Arc<watch::Sender<HandleStatus>>,
    closed: Arc<AtomicBool>,
}

impl<T: LedgerTransport> Worker<T> {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut backoff = Backoff::new(self.config.backoff);
        self.set_state(ConnectionState::Connecting);

        let reason = 'session: loop {
            let opened = tokio::select! {
                biased;
                command = commands.recv() => match Exit::from_command(command) {
                    Exit::Resubscribe => continue 'session,
                    _ => break 'session CloseReason::Unwatched,
                },
                opened = self.open() => opened,
            };
            if self.closed.load(Ordering::SeqCst) {
                drop(opened);
                break 'session CloseReason::Unwatched;
            }

            let exit = match opened {
                Ok((kind, stream)) => {
                    self.status.send_modify(|status| status.endpoint_kind = Some(kind));
                    info!(account = %self.account, ledger = %kind, "subscription opened");
                    self.pump(stream, &mut commands, &mut backoff).await
                }
                Err(err) => Exit::Disrupted(err.to_string()),
            };

            match exit {
                Exit::Shutdown => break 'session CloseReason::Unwatched,
                Exit::Resubscribe => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connecting);
                }
                Exit::Disrupted(cause) => {
                    let Some(delay) = backoff.next_delay() else {
                        warn!(
                            account = %self.account,
                            %cause,
                            attempts = backoff.attempts(),
                            "subscription retry budget exhausted"
                        );
                        break 'session CloseReason::RetriesExhausted(cause);
                    };
                    warn!(
                        account = %self.account,
                        %cause,
                        ?delay,
                        "subscription disrupted; reconnecting"
                    );
                    self.set_state(ConnectionState::Reconnecting {
                        attempt: backoff.attempts(),
                    });
                    tokio::select! {
                        biased;
                        command = commands.recv() => {
                            if let Exit::Shutdown = Exit::from_command(command) {
                                break 'session CloseReason::Unwatched;
                            }
                            backoff.reset();
                            self.set_state(ConnectionState::Connecting);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        info!(account = %self.account, ?reason, "subscription closed");
        self.set_state(ConnectionState::Closed { reason });
    }

    /// Resolve the owning endpoint afresh and open a subscription on it.
    async fn open(&self) -> Result<(LedgerKind, EventStream)> {
        let endpoint = self.router.endpoint_for(&self.account, Intent::Read).await?;
        let open_timeout = self.config.open_timeout;
        let stream = tokio::time::timeout(
            open_timeout,
            endpoint.transport().subscribe_account(&self.account),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "subscription open",
            after: open_timeout,
        })??;
        Ok((endpoint.kind(), stream))
    }

    /// Forward events until the stream breaks or a command arrives. Items
    /// already buffered by the transport are coalesced so only the newest
    /// update is applied, at most [`MAX_COALESCED`] at a time.
    async fn pump(
        &self,
        mut stream: EventStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        backoff: &mut Backoff,
    ) -> Exit {
        let mut pending = PendingEvent::default();
        loop {
            let item = tokio::select! {
                biased;
                command = commands.recv() => return Exit::from_command(command),
                item = self.next_item(&mut stream) => item,
            };

            let mut exit = self.handle_item(item, &mut pending, backoff);
            let mut drained = 1;
            while exit.is_none() && drained < MAX_COALESCED {
                let Some(item) = stream.next().now_or_never() else {
                    break;
                };
                drained += 1;
                let item = item.unwrap_or_else(stream_ended);
                exit = self.handle_item(item, &mut pending, backoff);
            }
            if let Some(event) = pending.take() {
                self.deliver(event);
            }
            if let Some(exit) = exit {
                return exit;
            }
            if drained == MAX_COALESCED {
                tokio::task::yield_now().await;
            }
        }
    }

    async fn next_item(&self, stream: &mut EventStream) -> TransportEvent {
        match self.config.heartbeat_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(item) => item.unwrap_or_else(stream_ended),
                Err(_) => TransportEvent::Disconnected("missed heartbeat".into()),
            },
            None => stream.next().await.unwrap_or_else(stream_ended),
        }
    }

    fn handle_item(
        &self,
        item: TransportEvent,
        pending: &mut PendingEvent,
        backoff: &mut Backoff,
    ) -> Option<Exit> {
        match item {
            TransportEvent::Acknowledged | TransportEvent::Heartbeat => {
                self.mark_live(backoff);
                None
            }
            TransportEvent::Update(event) => {
                self.mark_live(backoff);
                if event.account_id != self.account {
                    warn!(
                        account = %self.account,
                        other = %event.account_id,
                        "ignoring update for another account"
                    );
                } else {
                    pending.offer(event);
                }
                None
            }
            TransportEvent::Disconnected(cause) => Some(Exit::Disrupted(cause)),
        }
    }

    fn deliver(&self, event: AccountEvent) {
        let sequence = event.sequence;
        if let ApplyOutcome::Stale { current } = self.mirror.apply(event) {
            debug!(account = %self.account, sequence, current, "stale event ignored");
        }
        self.status.send_if_modified(|status| {
            if status.last_seen_sequence.is_some_and(|seen| seen >= sequence) {
                return false;
            }
            status.last_seen_sequence = Some(sequence);
            true
        });
    }

    fn mark_live(&self, backoff: &mut Backoff) {
        if self.set_state(ConnectionState::Live) {
            backoff.reset();
            info!(account = %self.account, "subscription live");
        }
    }

    /// Returns whether the state changed.
    fn set_state(&self, state: ConnectionState) -> bool {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            debug!(account = %self.account, from = ?status.state, to = ?state, "state");
            status.state = state;
            true
        })
    }
}

fn stream_ended() -> TransportEvent {
    TransportEvent::Disconnected("stream ended".into())
}
