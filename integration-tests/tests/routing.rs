#![allow(non_snake_case)]

use ledger_sync::{
    AccountId,
    DelegationCacheConfig,
    Error,
    Intent,
    LedgerKind,
    ReliabilityProfile,
    test_helpers::*,
};

#[tokio::test(start_paused = true)]
async fn endpoint_for__fails_when_assignment_never_resolved() {
    // given
    let ctx = TestContext::new();
    let account = AccountId::from_label("game-7");
    ctx.base.fail_lookups(true);

    // when
    let read = ctx.router.endpoint_for(&account, Intent::Read).await;
    let write = ctx.router.endpoint_for(&account, Intent::Write).await;

    // then
    assert!(matches!(read, Err(Error::RoutingUnavailable { .. })));
    assert!(matches!(write, Err(Error::RoutingUnavailable { .. })));
}

#[tokio::test(start_paused = true)]
async fn route_for__write_profile_follows_owning_ledger() {
    // given
    let ctx = TestContext::new();
    let on_base = AccountId::from_label("settled");
    let on_ephemeral = AccountId::from_label("in-play");
    ctx.base.undelegate(on_base);
    ctx.base.delegate(on_ephemeral);

    // when
    let base_route = ctx.router.route_for(&on_base, Intent::Write).await.unwrap();
    let ephemeral_route = ctx
        .router
        .route_for(&on_ephemeral, Intent::Write)
        .await
        .unwrap();

    // then
    assert_eq!(base_route.endpoint.kind(), LedgerKind::Base);
    assert_eq!(base_route.profile, ReliabilityProfile::durable_write());
    assert_eq!(ephemeral_route.endpoint.kind(), LedgerKind::Ephemeral);
    assert_eq!(ephemeral_route.profile, ReliabilityProfile::fast_write());
    assert!(ephemeral_route.profile.skip_preflight);
    assert!(
        ephemeral_route.profile.confirmation_timeout
            < base_route.profile.confirmation_timeout
    );
}

#[tokio::test(start_paused = true)]
async fn provider_for__hands_out_provider_with_route_profile() {
    let ctx = TestContext::new();
    let account = AccountId::from_label("in-play");
    ctx.base.delegate(account);

    let provider = ctx.router.provider_for(&account, Intent::Write).await.unwrap();

    assert_eq!(provider.profile, ReliabilityProfile::fast_write());
}

#[tokio::test]
async fn endpoint_for__concurrent_routing_shares_one_lookup() {
    // given
    let ctx = TestContext::new();
    let account = AccountId::from_label("game-42");
    ctx.base.delegate(account);
    ctx.base.hold_lookups();

    // when
    let routes = futures::future::join_all(
        (0..16).map(|i| {
            let intent = if i % 2 == 0 { Intent::Read } else { Intent::Write };
            ctx.router.endpoint_for(&account, intent)
        }),
    );
    let release = async {
        tokio::task::yield_now().await;
        ctx.base.release_lookups();
    };
    let (routes, ()) = tokio::join!(routes, release);

    // then
    assert_eq!(ctx.base.lookups(), 1);
    for route in routes {
        assert_eq!(route.unwrap().kind(), LedgerKind::Ephemeral);
    }
}

#[tokio::test(start_paused = true)]
async fn endpoint_for__keeps_last_route_while_base_is_unreachable() {
    // given
    let ctx = TestContext::with_config(
        DelegationCacheConfig {
            ttl: std::time::Duration::from_millis(100),
            ..DelegationCacheConfig::default()
        },
        test_subscription_config(),
    );
    let account = AccountId::from_label("game-42");
    ctx.base.delegate(account);
    ctx.router.endpoint_for(&account, Intent::Read).await.unwrap();

    // when
    tokio::time::advance(std::time::Duration::from_millis(200)).await;
    ctx.base.fail_lookups(true);
    let endpoint = ctx.router.endpoint_for(&account, Intent::Read).await.unwrap();

    // then
    assert_eq!(endpoint.kind(), LedgerKind::Ephemeral);
    assert!(ctx.cache.last_error(&account).is_some());
}
