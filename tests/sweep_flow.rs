//! Sweep scenarios against the simulated chains

mod common;

use std::sync::Arc;

use common::*;
use custody::storage::{AddressStore, SweepAuditStore};
use custody::sweep::{MSG_IN_PROGRESS, MSG_NO_MASTER_WALLET};
use custody::types::SweepStatus;

#[tokio::test]
async fn test_mixed_batch_is_isolated_and_ordered() {
    let s = scenario();
    let eth = s.address("user_1", "eth", "evm-test").await;
    let usdc = s.address("user_1", "usdc", "evm-test").await;
    let btc = s.address("user_1", "btc", "btc-test").await;
    s.credit_evm(&eth, 1_000_000).await;
    s.credit_evm(&usdc, 2_500).await;

    // Only the EVM network has a master wallet
    s.services
        .wallets
        .create("evm-test", "Treasury", "ETH", EVM_MASTER)
        .await
        .unwrap();

    let ids = vec![
        usdc.id.clone(),
        "addr_does_not_exist".to_string(),
        eth.id.clone(),
        btc.id.clone(),
    ];
    let results = s.services.sweeper.sweep(&ids).await;
    assert_eq!(results.len(), 4);
    let order: Vec<&str> = results.iter().map(|r| r.address_id.as_str()).collect();
    assert_eq!(order, ids.iter().map(String::as_str).collect::<Vec<_>>());

    assert_eq!(results[0].status, SweepStatus::NeedGas);
    assert_eq!(results[0].required_gas, Some(EVM_FEE));
    assert_eq!(results[1].status, SweepStatus::Error);
    assert_eq!(results[2].status, SweepStatus::Success);
    assert!(results[2].tx_hash.is_some());
    assert_eq!(results[3].status, SweepStatus::Error);
    assert_eq!(results[3].message, MSG_NO_MASTER_WALLET);
    assert_eq!(results[3].network_id.as_deref(), Some("btc-test"));

    let sent = s.evm.submitted_sweeps();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].amount, 1_000_000 - EVM_FEE);
    assert_eq!(s.evm.balance_of(EVM_MASTER), 1_000_000 - EVM_FEE);

    // Failed items left their addresses untouched
    let usdc_after = s.store.get_address(&usdc.id).await.unwrap().unwrap();
    assert_eq!(usdc_after.last_balance, 2_500);

    let audit = s.store.list_sweeps(10).await.unwrap();
    assert_eq!(audit.len(), 4);
}

#[tokio::test]
async fn test_token_sweep_with_gas() {
    let s = scenario();
    let usdc = s.address("user_1", "usdc", "evm-test").await;
    s.credit_evm(&usdc, 2_500).await;
    s.master_wallets().await;
    s.evm.set_native_balance(&usdc.address, EVM_FEE);

    let results = s.services.sweeper.sweep(&[usdc.id.clone()]).await;
    assert_eq!(results[0].status, SweepStatus::Success);
    assert_eq!(s.evm.submitted_sweeps()[0].amount, 2_500);
    assert_eq!(s.evm.balance_of(&usdc.address), 0);

    let addr = s.store.get_address(&usdc.id).await.unwrap().unwrap();
    assert_eq!(addr.last_balance, 0);
    assert_eq!(addr.baseline_epoch, 1);
}

#[tokio::test]
async fn test_concurrent_batches_never_double_sweep() {
    let s = scenario();
    let eth = s.address("user_1", "eth", "evm-test").await;
    s.credit_evm(&eth, 500_000).await;
    s.master_wallets().await;

    let sweeper = s.services.sweeper.clone();
    let ids = Arc::new(vec![eth.id.clone()]);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let sweeper = sweeper.clone();
            let ids = ids.clone();
            tokio::spawn(async move { sweeper.sweep(&ids).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        let result = handle.await.unwrap().remove(0);
        match result.status {
            SweepStatus::Success => successes += 1,
            SweepStatus::Error => assert!(
                result.message == MSG_IN_PROGRESS || result.message == "nothing to sweep",
                "unexpected error: {}",
                result.message
            ),
            SweepStatus::NeedGas => panic!("unexpected need_gas"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(s.evm.submitted_sweeps().len(), 1);
}

#[tokio::test]
async fn test_watcher_after_sweep_credits_only_new_value() {
    let s = scenario();
    let eth = s.address("user_1", "eth", "evm-test").await;
    s.credit_evm(&eth, 100_000).await;
    s.master_wallets().await;

    let results = s.services.sweeper.sweep(&[eth.id.clone()]).await;
    assert_eq!(results[0].status, SweepStatus::Success);

    // The outflow is not a deposit and not an unexpected decrease
    s.evm.mine(1);
    let report = s.poll(&eth).await;
    assert_eq!(report.detected, 0);
    assert!(!report.rebaselined);

    s.credit_evm(&eth, 7_000).await;
    assert_eq!(s.ledger.balance("user_1", "eth"), 107_000);
    assert_eq!(s.ledger.credits().len(), 2);
}

#[tokio::test]
async fn test_bitcoin_sweep_pays_fee_from_balance() {
    let s = scenario();
    let btc = s.address("user_1", "btc", "btc-test").await;
    s.btc.deposit(&btc.address, 80_000);
    s.btc.mine(1);
    s.poll(&btc).await;
    assert_eq!(s.ledger.balance("user_1", "btc"), 80_000);
    s.master_wallets().await;

    let results = s.services.sweeper.sweep(&[btc.id.clone()]).await;
    assert_eq!(results[0].status, SweepStatus::Success);
    let sent = s.btc.submitted_sweeps();
    assert_eq!(sent[0].amount, 80_000 - 500);
    assert_eq!(sent[0].to, BTC_MASTER);

    // Swept history does not come back as a new deposit
    s.btc.mine(1);
    let report = s.poll(&btc).await;
    assert_eq!(report.detected, 0);
    assert_eq!(s.ledger.credits().len(), 1);
}

#[tokio::test]
async fn test_unreachable_chain_reports_error() {
    let s = scenario();
    let eth = s.address("user_1", "eth", "evm-test").await;
    s.credit_evm(&eth, 90_000).await;
    s.master_wallets().await;
    s.evm.set_unreachable(true);

    let results = s.services.sweeper.sweep(&[eth.id.clone()]).await;
    assert_eq!(results[0].status, SweepStatus::Error);
    s.evm.set_unreachable(false);

    let addr = s.store.get_address(&eth.id).await.unwrap().unwrap();
    assert_eq!(addr.last_balance, 90_000);
    assert!(s.evm.submitted_sweeps().is_empty());
}
