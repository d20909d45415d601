use crate::{
    Result,
    types::{
        AccountEvent,
        AccountId,
        ProgramId,
        ReliabilityProfile,
    },
};
use futures::stream::BoxStream;

/// Items produced by an open account subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The ledger confirmed the subscription.
    Acknowledged,
    Update(AccountEvent),
    /// Keep-alive with no state change.
    Heartbeat,
    /// The connection was lost. The stream yields nothing useful afterwards.
    Disconnected(String),
}

/// An open push subscription. Dropping it releases the underlying resource.
pub type EventStream = BoxStream<'static, TransportEvent>;

/// Network access to a single ledger, supplied by the wallet/RPC layer.
///
/// One instance exists per ledger for the life of the process and is shared
/// read-only by every caller.
pub trait LedgerTransport: Send + Sync + 'static {
    /// Request-submission handle configured with a reliability profile.
    type Provider: Send + Sync;

    /// The program owning `account`, or `None` if the account does not exist.
    fn get_account_owner(
        &self,
        account: &AccountId,
    ) -> impl Future<Output = Result<Option<ProgramId>>> + Send;

    fn subscribe_account(
        &self,
        account: &AccountId,
    ) -> impl Future<Output = Result<EventStream>> + Send;

    fn provider_for(&self, profile: &ReliabilityProfile) -> Self::Provider;
}
