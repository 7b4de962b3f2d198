//! Bot wallet pool lifecycle against the store and a scripted chain.

mod common;

use anyhow::Result;
use std::collections::HashSet;

use common::{Harness, TxKind};
use launchsnipe::types::{Role, WalletState, LAMPORTS_PER_SOL};

#[tokio::test]
async fn test_reservations_never_share_wallets() -> Result<()> {
    let h = Harness::new().await?;
    let (owner, _) = h.user(Role::Creator, LAMPORTS_PER_SOL).await?;

    let first = h.pool.reserve(&owner.wallet, 2).await?;
    let second = h.pool.reserve(&owner.wallet, 2).await?;
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_ne!(first.id, second.id);

    let a: HashSet<_> = first.wallets.iter().map(|w| w.address.clone()).collect();
    let b: HashSet<_> = second.wallets.iter().map(|w| w.address.clone()).collect();
    assert!(a.is_disjoint(&b));
    assert_eq!(h.store.list_bot_wallets(&owner.wallet).await?.len(), 4);
    assert_eq!(h.store.wallets_for_reservation(&first.id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_released_wallets_are_reused() -> Result<()> {
    let h = Harness::new().await?;
    let (owner, _) = h.user(Role::Creator, LAMPORTS_PER_SOL).await?;

    let mut first = h.pool.reserve(&owner.wallet, 3).await?;
    h.pool.release(&mut first).await?;
    for wallet in h.store.list_bot_wallets(&owner.wallet).await? {
        assert_eq!(wallet.state, WalletState::Ready);
        assert_eq!(wallet.reservation, None);
    }

    let again = h.pool.reserve(&owner.wallet, 3).await?;
    assert_eq!(h.store.list_bot_wallets(&owner.wallet).await?.len(), 3);
    let before: HashSet<_> = first.wallets.iter().map(|w| w.id).collect();
    assert!(again.wallets.iter().all(|w| before.contains(&w.id)));
    Ok(())
}

#[tokio::test]
async fn test_pre_fund_must_exceed_buy() -> Result<()> {
    let h = Harness::new().await?;
    let (owner, key) = h.user(Role::Creator, LAMPORTS_PER_SOL).await?;
    let mut reservation = h.pool.reserve(&owner.wallet, 2).await?;

    let err = h
        .pool
        .pre_fund(&mut reservation, &key, 50_000_000, 50_000_000)
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "validation");
    assert!(h.net.bundles().is_empty());
    assert!(reservation.wallets.iter().all(|w| w.prefunded_amount == 0));
    Ok(())
}

#[tokio::test]
async fn test_pre_fund_sends_one_funding_transaction() -> Result<()> {
    let h = Harness::new().await?;
    let (owner, key) = h.user(Role::Creator, LAMPORTS_PER_SOL).await?;
    let mut reservation = h.pool.reserve(&owner.wallet, 3).await?;

    h.pool.pre_fund(&mut reservation, &key, 60_000_000, 50_000_000).await?;

    let bundles = h.net.bundles();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].len(), 1);
    assert_eq!(h.net.kind_of(&bundles[0][0].signature), Some(TxKind::Fund));

    for wallet in h.store.wallets_for_reservation(&reservation.id).await? {
        assert_eq!(wallet.state, WalletState::Funded);
        assert_eq!(wallet.prefunded_amount, 60_000_000);
        assert_eq!(wallet.intended_buy, 50_000_000);
        assert_eq!(wallet.funding_signature.as_deref(), Some(bundles[0][0].signature.as_str()));
    }
    Ok(())
}

#[tokio::test]
async fn test_unlanded_funding_rolls_back() -> Result<()> {
    let h = Harness::new().await?;
    let (owner, key) = h.user(Role::Creator, LAMPORTS_PER_SOL).await?;
    h.net.state.lock().unwrap().land_funding = false;
    let mut reservation = h.pool.reserve(&owner.wallet, 2).await?;
    let snapshot = reservation.wallets.clone();

    let err = h
        .pool
        .pre_fund(&mut reservation, &key, 60_000_000, 50_000_000)
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "bundle_not_landed");
    assert_eq!(reservation.wallets, snapshot);

    let stored = h.store.wallets_for_reservation(&reservation.id).await?;
    assert_eq!(stored.len(), 2);
    assert!(stored
        .iter()
        .all(|w| w.state == WalletState::Pending && w.prefunded_amount == 0 && w.funding_signature.is_none()));
    Ok(())
}

#[tokio::test]
async fn test_bound_wallets_must_be_unbound_before_release() -> Result<()> {
    let h = Harness::new().await?;
    let (owner, key) = h.user(Role::Creator, LAMPORTS_PER_SOL).await?;
    let mut reservation = h.pool.reserve(&owner.wallet, 2).await?;

    // Unfunded wallets cannot join a launch.
    assert!(h.pool.consume(7, &mut reservation).await.is_err());

    h.pool.pre_fund(&mut reservation, &key, 60_000_000, 50_000_000).await?;
    h.pool.consume(7, &mut reservation).await?;
    assert_eq!(h.store.wallets_for_launch(7).await?.len(), 2);
    let bound = h.store.get_bot_wallet(reservation.wallets[0].id).await?.expect("wallet");
    assert_eq!(bound.launch_id, Some(7));

    let err = h.pool.release(&mut reservation).await.unwrap_err();
    assert_eq!(err.reason_code(), "validation");

    h.pool.unbind(&mut reservation).await?;
    h.pool.release(&mut reservation).await?;
    assert!(h.store.wallets_for_launch(7).await?.is_empty());
    for wallet in h.store.list_bot_wallets(&owner.wallet).await? {
        assert_eq!(wallet.state, WalletState::Ready);
        assert_eq!(wallet.prefunded_amount, 0);
    }
    Ok(())
}
