use crate::{
    lock,
    types::{
        AccountEvent,
        AccountId,
        GameStateSnapshot,
    },
};
use futures::{
    Stream,
    StreamExt,
    future,
    stream::BoxStream,
};
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc,
        Mutex,
        Weak,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    task::{
        Context,
        Poll,
    },
};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;


/// Current snapshot first, then every later replacement. Intermediate
/// snapshots may be skipped if the consumer falls behind.
pub type SnapshotStream = BoxStream<'static, Arc<GameStateSnapshot>>;

type Slot = watch::Sender<Option<Arc<GameStateSnapshot>>>;
type Slots = Mutex<HashMap<AccountId, Slot>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Duplicate or reordered event; `current` is the sequence kept.
    Stale { current: u64 },
}

/// Client-side cache of game account state.
#[derive(Default)]
pub struct StateMirror {
    slots: Arc<Slots>,
    stale_events: AtomicU64,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the account's snapshot if `event` is newer than it.
    pub fn apply(&self, event: AccountEvent) -> ApplyOutcome {
        let account = event.account_id;
        let sequence = event.sequence;
        let mut kept = None;
        let applied = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(account).or_insert_with(empty_slot);
            slot.send_if_modified(|current| match current {
                Some(snapshot) if sequence <= snapshot.sequence => {
                    kept = Some(snapshot.sequence);
                    false
                }
                _ => {
                    *current = Some(Arc::new(GameStateSnapshot::from(event)));
                    true
                }
            })
        };

        match kept {
            Some(current) if !applied => {
                self.stale_events.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    account = %account,
                    sequence,
                    current,
                    "discarding stale event"
                );
                ApplyOutcome::Stale { current }
            }
            _ => {
                tracing::debug!(account = %account, sequence, "snapshot replaced");
                ApplyOutcome::Applied
            }
        }
    }

    pub fn read(&self, account: &AccountId) -> Option<Arc<GameStateSnapshot>> {
        lock(&self.slots)
            .get(account)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Follow an account's snapshots from now on. Dropping the stream
    /// unregisters the listener.
    pub fn subscribe(&self, account: &AccountId) -> SnapshotStream {
        let receiver = lock(&self.slots)
            .entry(*account)
            .or_insert_with(empty_slot)
            .subscribe();
        Listener {
            account: *account,
            slots: Arc::downgrade(&self.slots),
            inner: Some(WatchStream::new(receiver).filter_map(future::ready).boxed()),
        }
        .boxed()
    }

    /// Events discarded because their sequence was not newer.
    pub fn stale_event_count(&self) -> u64 {
        self.stale_events.load(Ordering::Relaxed)
    }

    /// Accounts holding a snapshot or a listener.
    pub fn tracked_accounts(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn listener_count(&self, account: &AccountId) -> usize {
        lock(&self.slots)
            .get(account)
            .map(|slot| slot.receiver_count())
            .unwrap_or(0)
    }
}

fn empty_slot() -> Slot {
    watch::channel(None).0
}

/// Snapshot stream that removes its account's slot on drop when the slot
/// never received a snapshot and has no other listener.
struct Listener {
    account: AccountId,
    slots: Weak<Slots>,
    inner: Option<SnapshotStream>,
}

impl Stream for Listener {
    type Item = Arc<GameStateSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let Some(slots) = self.slots.upgrade() else {
            return;
        };
        let mut slots = lock(&slots);
        // The receiver must be released under the lock before counting.
        self.inner = None;
        let vacant = slots
            .get(&self.account)
            .is_some_and(|slot| slot.borrow().is_none() && slot.receiver_count() == 0);
        if vacant {
            slots.remove(&self.account);
        }
    }
}
