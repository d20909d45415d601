use crate::{
    Result,
    delegation_cache::DelegationCache,
    transport::LedgerTransport,
    types::{
        AccountId,
        Intent,
        LedgerKind,
        ReliabilityProfile,
    },
};
use std::{
    fmt,
    sync::Arc,
};

/// One ledger connection. Built once per ledger kind and never mutated.
pub struct Endpoint<T> {
    kind: LedgerKind,
    transport: Arc<T>,
    read_profile: ReliabilityProfile,
    write_profile: ReliabilityProfile,
}

impl<T> Endpoint<T> {
    pub fn new(kind: LedgerKind, transport: Arc<T>) -> Self {
        Self {
            kind,
            transport,
            read_profile: ReliabilityProfile::read(),
            write_profile: ReliabilityProfile::write_default_for(kind),
        }
    }

    pub fn with_write_profile(mut self, profile: ReliabilityProfile) -> Self {
        self.write_profile = profile;
        self
    }

    pub fn with_read_profile(mut self, profile: ReliabilityProfile) -> Self {
        self.read_profile = profile;
        self
    }

    pub fn kind(&self) -> LedgerKind {
        self.kind
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn profile_for(&self, intent: Intent) -> ReliabilityProfile {
        match intent {
            Intent::Read => self.read_profile,
            Intent::Write => self.write_profile,
        }
    }
}

impl<T> fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .field("read_profile", &self.read_profile)
            .field("write_profile", &self.write_profile)
            .finish_non_exhaustive()
    }
}

/// A routing decision: the owning endpoint plus the profile for the intent.
pub struct Route<T> {
    pub endpoint: Arc<Endpoint<T>>,
    pub intent: Intent,
    pub profile: ReliabilityProfile,
}

impl<T> Clone for Route<T> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            intent: self.intent,
            profile: self.profile,
        }
    }
}

pub struct ConnectionRouter<T> {
    cache: Arc<DelegationCache<T>>,
    base: Arc<Endpoint<T>>,
    ephemeral: Arc<Endpoint<T>>,
}

impl<T: LedgerTransport> ConnectionRouter<T> {
    pub fn new(
        cache: Arc<DelegationCache<T>>,
        base: Endpoint<T>,
        ephemeral: Endpoint<T>,
    ) -> Self {
        debug_assert_eq!(base.kind(), LedgerKind::Base);
        debug_assert_eq!(ephemeral.kind(), LedgerKind::Ephemeral);
        Self {
            cache,
            base: Arc::new(base),
            ephemeral: Arc::new(ephemeral),
        }
    }

    pub fn cache(&self) -> &Arc<DelegationCache<T>> {
        &self.cache
    }

    pub fn endpoint(&self, kind: LedgerKind) -> &Arc<Endpoint<T>> {
        match kind {
            LedgerKind::Base => &self.base,
            LedgerKind::Ephemeral => &self.ephemeral,
        }
    }

    /// The endpoint currently owning `account`. Never falls back to a default
    /// ledger: without an assignment the call fails with `RoutingUnavailable`.
    pub async fn endpoint_for(
        &self,
        account: &AccountId,
        intent: Intent,
    ) -> Result<Arc<Endpoint<T>>> {
        let kind = self.cache.current_assignment(account).await?;
        tracing::trace!(account = %account, ledger = %kind, ?intent, "routed");
        Ok(Arc::clone(self.endpoint(kind)))
    }

    pub async fn route_for(&self, account: &AccountId, intent: Intent) -> Result<Route<T>> {
        let endpoint = self.endpoint_for(account, intent).await?;
        let profile = endpoint.profile_for(intent);
        Ok(Route {
            endpoint,
            intent,
            profile,
        })
    }

    /// A submission handle for `account` configured for `intent`.
    pub async fn provider_for(
        &self,
        account: &AccountId,
        intent: Intent,
    ) -> Result<T::Provider> {
        let route = self.route_for(account, intent).await?;
        Ok(route.endpoint.transport().provider_for(&route.profile))
    }
}
