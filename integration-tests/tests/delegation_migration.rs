#![allow(non_snake_case)]

use futures::StreamExt;
use ledger_sync::{
    AccountId,
    ConnectionState,
    LedgerKind,
    test_helpers::*,
};

#[tokio::test(start_paused = true)]
async fn delegation__moves_open_subscription_to_ephemeral_ledger() {
    // given
    let ctx = TestContext::new();
    let account = AccountId::from_label("game-42");
    ctx.base.undelegate(account);
    assert_eq!(
        ctx.cache.current_assignment(&account).await.unwrap(),
        LedgerKind::Base
    );
    let handle = ctx.manager.watch(account);
    handle
        .wait_until(|status| status.state == ConnectionState::Live)
        .await;
    assert_eq!(ctx.base.open_subscriptions(), 1);

    // when
    ctx.base.delegate(account);
    ctx.cache.invalidate(&account);
    let kind = ctx.cache.current_assignment(&account).await.unwrap();
    let status = handle
        .wait_until(|status| {
            status.state == ConnectionState::Live
                && status.endpoint_kind == Some(LedgerKind::Ephemeral)
        })
        .await;

    // then
    assert_eq!(kind, LedgerKind::Ephemeral);
    assert_eq!(status.endpoint_kind, Some(LedgerKind::Ephemeral));
    assert_eq!(ctx.base.open_subscriptions(), 0);
    assert_eq!(ctx.ephemeral.open_subscriptions(), 1);
    assert_eq!(ctx.ephemeral.subscribe_calls(&account).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn delegation__mirror_keeps_newest_state_across_the_move() {
    // given
    let ctx = TestContext::new();
    let account = AccountId::from_label("game-42");
    ctx.base.undelegate(account);
    let handle = ctx.manager.watch(account);
    handle
        .wait_until(|status| status.state == ConnectionState::Live)
        .await;
    ctx.base.push_update(&account, 7, "turn seven");
    handle
        .wait_until(|status| status.last_seen_sequence == Some(7))
        .await;

    // when
    ctx.base.delegate(account);
    ctx.cache.invalidate(&account);
    ctx.cache.current_assignment(&account).await.unwrap();
    handle
        .wait_until(|status| {
            status.state == ConnectionState::Live
                && status.endpoint_kind == Some(LedgerKind::Ephemeral)
        })
        .await;
    ctx.ephemeral.push_update(&account, 5, "replayed turn five");
    ctx.ephemeral.push_update(&account, 8, "turn eight");
    handle
        .wait_until(|status| status.last_seen_sequence == Some(8))
        .await;

    // then
    let snapshot = ctx.mirror.read(&account).unwrap();
    assert_eq!(snapshot.sequence, 8);
    assert_eq!(snapshot.payload, b"turn eight".to_vec());
}

#[tokio::test(start_paused = true)]
async fn undelegation__moves_subscription_back_to_base() {
    // given
    let ctx = TestContext::new();
    let account = AccountId::from_label("game-42");
    ctx.base.delegate(account);
    let handle = ctx.manager.watch(account);
    handle
        .wait_until(|status| {
            status.state == ConnectionState::Live
                && status.endpoint_kind == Some(LedgerKind::Ephemeral)
        })
        .await;

    // when
    ctx.base.undelegate(account);
    ctx.cache.invalidate(&account);
    ctx.cache.current_assignment(&account).await.unwrap();
    handle
        .wait_until(|status| {
            status.state == ConnectionState::Live
                && status.endpoint_kind == Some(LedgerKind::Base)
        })
        .await;

    // then
    assert_eq!(ctx.ephemeral.open_subscriptions(), 0);
    assert_eq!(ctx.base.open_subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_event__late_sequence_five_leaves_sequence_seven() {
    // given
    let ctx = TestContext::new();
    let account = AccountId::from_label("game-42");
    let handle = ctx.manager.watch(account);
    handle
        .wait_until(|status| status.state == ConnectionState::Live)
        .await;
    let mut snapshots = ctx.mirror.subscribe(&account);
    ctx.base.push_update(&account, 7, "seven");
    assert_eq!(snapshots.next().await.unwrap().sequence, 7);

    // when
    ctx.base.push_update(&account, 5, "five");
    ctx.base.push_update(&account, 9, "nine");
    let next = snapshots.next().await.unwrap();

    // then
    assert_eq!(next.sequence, 9);
    ctx.base.push_update(&account, 5, "five again");
    handle
        .wait_until(|status| status.last_seen_sequence == Some(9))
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(ctx.mirror.read(&account).unwrap().payload, b"nine".to_vec());
}
