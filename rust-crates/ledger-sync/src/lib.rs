pub mod config;
pub mod delegation_cache;
pub mod router;
pub mod state_mirror;
pub mod subscription;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::{
    BackoffPolicy,
    DelegationCacheConfig,
    SubscriptionConfig,
};
pub use delegation_cache::{
    AssignmentChange,
    DelegationCache,
    DelegationClassifier,
    OwnerProgramClassifier,
};
pub use router::{
    ConnectionRouter,
    Endpoint,
    Route,
};
pub use state_mirror::{
    ApplyOutcome,
    SnapshotStream,
    StateMirror,
};
pub use subscription::{
    CloseReason,
    ConnectionState,
    SubscriptionHandle,
    SubscriptionManager,
};
pub use transport::{
    EventStream,
    LedgerTransport,
    TransportEvent,
};
pub use types::{
    AccountEvent,
    AccountId,
    GameStateSnapshot,
    Intent,
    LedgerKind,
    ProgramId,
    ReliabilityProfile,
};

use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the routing and synchronization layer.
///
/// `Clone` so a single in-flight refresh can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No fresh or stale delegation record could be obtained for the account.
    #[error("routing unavailable for account {account}: {reason}")]
    RoutingUnavailable { account: AccountId, reason: String },
    /// A subscription could not be opened or was lost and the retry budget ran out.
    #[error("subscription transport error: {0}")]
    SubscriptionTransport(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// Failure reported by the transport collaborator.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid account id: {0}")]
    InvalidAccountId(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Transport(_) | Error::SubscriptionTransport(_)
        )
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
