//! Deposit Watcher
//!
//! Evaluates one deposit address per call and drives its deposits through
//! pending -> confirming -> completed | failed. Two detection modes:
//!
//! - transfer history: one deposit per inbound transaction hash; an open
//!   deposit whose transaction leaves the history is failed (reorg)
//! - balance delta: one deposit per increase over `last_balance`, keyed by the
//!   (epoch, pre, post) snapshot; a drop below the snapshot before completion
//!   fails it and re-baselines the address
//!
//! Completion credits the ledger first and then, in one storage transaction,
//! marks the deposit completed and advances `last_balance`. A crash between
//! the two re-issues the same idempotency key on the next poll, which the
//! ledger drops.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::locks::AddressLocks;
use crate::chain::{with_timeout, ChainClient, ChainClients, InboundTransfer};
use crate::collaborators::{CreditOutcome, CreditRequest, FxRateFeed, Ledger};
use crate::common::error::{CustodyError, Result};
use crate::common::{log_deposit_event, now_secs};
use crate::registry::NetworkRegistry;
use crate::storage::{AddressStore, CustodyStore, DepositTxStore, StorageError};
use crate::types::{
    delta_key, redetection_key, to_whole_units, transfer_key, DepositAddress, DepositTransaction,
    DepositTxStatus, Network,
};

/// Blocks after which an unconfirmed sweep marker is dropped
const SETTLE_BLOCKS: u64 = 20;

/// Outcome of one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub detected: usize,
    pub updated: usize,
    pub completed: usize,
    pub failed: usize,
    pub rebaselined: bool,
    /// Locked, inactive or missing address
    pub skipped: bool,
}

impl PollReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// A sweep that left the address but may not be visible in its balance yet
#[derive(Debug, Clone, Copy)]
struct Settling {
    /// Balance the orchestrator saw before submitting
    visible_before: u128,
    /// Value that left the address (amount plus fee when paid from it)
    outbound: u128,
    /// Tip when the watcher first saw the marker
    first_seen: Option<u64>,
}

pub struct DepositWatcher {
    store: Arc<dyn CustodyStore>,
    networks: Arc<NetworkRegistry>,
    chains: ChainClients,
    ledger: Arc<dyn Ledger>,
    fx: Arc<dyn FxRateFeed>,
    locks: Arc<AddressLocks>,
    rpc_timeout: Duration,
    settling: DashMap<String, Settling>,
}

impl DepositWatcher {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        networks: Arc<NetworkRegistry>,
        chains: ChainClients,
        ledger: Arc<dyn Ledger>,
        fx: Arc<dyn FxRateFeed>,
        locks: Arc<AddressLocks>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            store,
            networks,
            chains,
            ledger,
            fx,
            locks,
            rpc_timeout,
            settling: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CustodyStore> {
        &self.store
    }

    pub fn networks(&self) -> &Arc<NetworkRegistry> {
        &self.networks
    }

    /// Evaluate every active address of a network once, sequentially
    pub async fn poll_network(&self, network_id: &str) -> Result<Vec<(String, Result<PollReport>)>> {
        let addresses = self.store.list_active_addresses(network_id).await?;
        let mut reports = Vec::with_capacity(addresses.len());
        for address in addresses {
            let report = self.poll_address(&address.id).await;
            reports.push((address.id, report));
        }
        Ok(reports)
    }

    /// Evaluate one address
    pub async fn poll_address(&self, address_id: &str) -> Result<PollReport> {
        let Some(_gate) = self.locks.try_evaluate(address_id) else {
            tracing::debug!(
                target: "custody::deposit",
                address_id = %address_id,
                "Address busy, skipping evaluation"
            );
            return Ok(PollReport::skipped());
        };

        let address = match self.store.get_address(address_id).await? {
            Some(a) if a.is_active => a,
            _ => return Ok(PollReport::skipped()),
        };
        let network = self.networks.resolve(&address.asset_id, &address.network_id)?;
        let chain = self.chains.get(&network.id).ok_or_else(|| {
            CustodyError::configuration(&network.id, "no chain client configured")
        })?;

        let tip = with_timeout(self.rpc_timeout, "tip_height", chain.tip_height(network)).await?;

        if chain.supports_transfer_history() {
            self.poll_transfers(&address, network, chain.as_ref(), tip).await
        } else {
            self.poll_delta(address, network, chain.as_ref(), tip).await
        }
    }

    async fn poll_transfers(
        &self,
        address: &DepositAddress,
        network: &Network,
        chain: &dyn ChainClient,
        tip: u64,
    ) -> Result<PollReport> {
        let transfers = with_timeout(
            self.rpc_timeout,
            "inbound_transfers",
            chain.inbound_transfers(network, &address.address),
        )
        .await?;

        let mut report = PollReport::default();
        let mut last_balance = address.last_balance;
        let mut seen = HashSet::new();

        for transfer in transfers.iter().filter(|t| t.amount >= network.min_deposit.max(1)) {
            let (key, existing) = self.current_detection(address, network, transfer).await?;
            seen.insert(key.clone());

            let mut deposit = match existing {
                Some(existing) if existing.is_open() => existing,
                Some(_) => continue,
                None => {
                    let mut deposit = DepositTransaction::new(
                        &address.id,
                        transfer.amount,
                        network.confirmation_threshold,
                        &key,
                    );
                    deposit.tx_hash = Some(transfer.tx_hash.clone());
                    deposit.baseline_balance = last_balance;
                    deposit.observed_balance = last_balance + transfer.amount;
                    deposit.detected_height = transfer.block_height.unwrap_or(tip);
                    deposit.usd_value = self.usd_value(network, transfer.amount).await;
                    deposit.update_confirmations(transfer.confirmations);

                    match self.store.insert_deposit(&deposit).await {
                        Ok(()) => {}
                        Err(StorageError::Duplicate(_)) => continue,
                        Err(e) => return Err(e.into()),
                    }
                    report.detected += 1;
                    log_deposit_event(
                        "deposit_detected",
                        &deposit.id,
                        &address.id,
                        deposit.amount,
                        deposit.confirmations,
                        None,
                    );
                    deposit
                }
            };

            if deposit.confirmations != transfer.confirmations {
                deposit.update_confirmations(transfer.confirmations);
                report.updated += 1;
            }

            if deposit.is_confirmed() {
                let new_balance = last_balance + deposit.amount;
                self.complete(address, deposit, new_balance).await?;
                last_balance = new_balance;
                report.completed += 1;
            } else {
                self.store.update_deposit(&deposit).await?;
            }
        }

        // Open deposits whose transaction is gone were reorganized out
        for mut deposit in self.store.open_deposits(&address.id).await? {
            if seen.contains(&deposit.idempotency_key) {
                continue;
            }
            deposit.mark_failed("transaction no longer in chain history");
            self.store.update_deposit(&deposit).await?;
            report.failed += 1;
            log_deposit_event(
                "deposit_failed",
                &deposit.id,
                &address.id,
                deposit.amount,
                deposit.confirmations,
                Some("transaction no longer in chain history"),
            );
        }

        Ok(report)
    }

    /// Latest detection of `transfer`: the first key in its re-detection
    /// sequence that is not a failed record, with the record if one exists
    async fn current_detection(
        &self,
        address: &DepositAddress,
        network: &Network,
        transfer: &InboundTransfer,
    ) -> Result<(String, Option<DepositTransaction>)> {
        let base = transfer_key(&network.id, &address.id, &transfer.tx_hash);
        let mut attempt = 0;
        loop {
            let key = redetection_key(&base, attempt);
            match self.store.find_deposit_by_key(&address.id, &key).await? {
                Some(failed) if failed.status == DepositTxStatus::Failed => attempt += 1,
                found => return Ok((key, found)),
            }
        }
    }

    async fn poll_delta(
        &self,
        address: DepositAddress,
        network: &Network,
        chain: &dyn ChainClient,
        tip: u64,
    ) -> Result<PollReport> {
        let raw = with_timeout(
            self.rpc_timeout,
            "balance",
            chain.balance(network, &address.address),
        )
        .await?;
        let balance = self.settled_balance(&address.id, raw, tip);
        let mut report = PollReport::default();

        if let Some(mut deposit) = self.store.open_deposits(&address.id).await?.pop() {
            if balance < deposit.observed_balance {
                let reason = format!(
                    "balance fell to {} below observed {}",
                    balance, deposit.observed_balance
                );
                deposit.mark_failed(&reason);
                self.store.update_deposit(&deposit).await?;
                self.store.rebaseline(&address.id, balance).await?;
                report.failed += 1;
                report.rebaselined = true;
                log_deposit_event(
                    "deposit_failed",
                    &deposit.id,
                    &address.id,
                    deposit.amount,
                    deposit.confirmations,
                    Some(&reason),
                );
                return Ok(report);
            }

            let confirmations = tip.saturating_sub(deposit.detected_height);
            let confirmations = u32::try_from(confirmations).unwrap_or(u32::MAX);
            if deposit.confirmations != confirmations {
                deposit.update_confirmations(confirmations);
                report.updated += 1;
            }

            if deposit.is_confirmed() {
                let observed = deposit.observed_balance;
                self.complete(&address, deposit, observed).await?;
                report.completed += 1;
            } else {
                self.store.update_deposit(&deposit).await?;
            }
            return Ok(report);
        }

        if balance > address.last_balance {
            let delta = balance - address.last_balance;
            if delta < network.min_deposit {
                return Ok(report);
            }
            let key = delta_key(
                &network.id,
                &address.id,
                address.baseline_epoch,
                address.last_balance,
                balance,
            );
            if self.store.find_deposit_by_key(&address.id, &key).await?.is_some() {
                return Ok(report);
            }

            let mut deposit =
                DepositTransaction::new(&address.id, delta, network.confirmation_threshold, &key);
            deposit.baseline_balance = address.last_balance;
            deposit.observed_balance = balance;
            deposit.detected_height = tip;
            deposit.usd_value = self.usd_value(network, delta).await;

            match self.store.insert_deposit(&deposit).await {
                Ok(()) => {}
                Err(StorageError::Duplicate(_)) => return Ok(report),
                Err(e) => return Err(e.into()),
            }
            report.detected += 1;
            log_deposit_event(
                "deposit_detected",
                &deposit.id,
                &address.id,
                deposit.amount,
                0,
                None,
            );
        } else if balance < address.last_balance {
            // Outflow nobody initiated through a sweep: re-baseline, never credit
            tracing::warn!(
                target: "custody::deposit",
                address_id = %address.id,
                last_balance = %address.last_balance,
                balance = %balance,
                "Unexpected balance decrease, re-baselining"
            );
            self.store.rebaseline(&address.id, balance).await?;
            report.rebaselined = true;
        }

        Ok(report)
    }

    /// Balance with an unconfirmed sweep taken out
    fn settled_balance(&self, address_id: &str, raw: u128, tip: u64) -> u128 {
        let Some(mut entry) = self.settling.get_mut(address_id) else {
            return raw;
        };
        let first_seen = *entry.first_seen.get_or_insert(tip);
        let settled = raw < entry.visible_before || tip >= first_seen + SETTLE_BLOCKS;
        let outbound = entry.outbound;
        drop(entry);

        if settled {
            self.settling.remove(address_id);
            raw
        } else {
            raw.saturating_sub(outbound)
        }
    }

    async fn complete(
        &self,
        address: &DepositAddress,
        mut deposit: DepositTransaction,
        new_last_balance: u128,
    ) -> Result<()> {
        // Persist the confirmation count before the credit so a failed call
        // leaves an accurate open record
        self.store.update_deposit(&deposit).await?;

        let request = CreditRequest {
            user_id: address.owner_user_id.clone(),
            asset_id: address.asset_id.clone(),
            amount: deposit.amount,
            idempotency_key: deposit.idempotency_key.clone(),
        };
        let outcome = self.ledger.credit(&request).await?;

        deposit
            .mark_completed()
            .map_err(CustodyError::internal)?;
        self.store
            .complete_deposit(&deposit, new_last_balance, now_secs())
            .await?;

        let event = match outcome {
            CreditOutcome::Applied => "deposit_credited",
            CreditOutcome::Duplicate => "deposit_credit_replayed",
        };
        log_deposit_event(
            event,
            &deposit.id,
            &address.id,
            deposit.amount,
            deposit.confirmations,
            None,
        );
        Ok(())
    }

    async fn usd_value(&self, network: &Network, amount: u128) -> f64 {
        match self.fx.usd_rate(&network.asset_id).await {
            Ok(rate) => to_whole_units(amount, network.decimals) * rate,
            Err(e) => {
                tracing::warn!(
                    target: "custody::deposit",
                    asset_id = %network.asset_id,
                    error = %e,
                    "FX rate unavailable, recording zero USD value"
                );
                0.0
            }
        }
    }

    /// Reset `last_balance` after a successful sweep
    ///
    /// `visible_before` and `outbound` let balance-delta evaluation ignore the
    /// sweep until the chain reflects it.
    pub async fn rebaseline(
        &self,
        address_id: &str,
        new_baseline: u128,
        visible_before: u128,
        outbound: u128,
    ) -> Result<DepositAddress> {
        let record = self.store.rebaseline(address_id, new_baseline).await?;
        self.settling.insert(
            address_id.to_string(),
            Settling {
                visible_before,
                outbound,
                first_seen: None,
            },
        );
        tracing::info!(
            target: "custody::deposit",
            address_id = %address_id,
            last_balance = %new_baseline,
            epoch = record.baseline_epoch,
            "Address re-baselined after sweep"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChain;
    use crate::collaborators::fx::MockFxRateFeed;
    use crate::collaborators::ledger::MockLedger;
    use crate::collaborators::{FixedRateFeed, InMemoryLedger, LedgerError};
    use crate::common::config::Deployment;
    use crate::storage::{AddressStore, DepositTxStore, MemoryCustodyStore};

    struct Harness {
        watcher: DepositWatcher,
        store: MemoryCustodyStore,
        chain: Arc<SimulatedChain>,
        address: DepositAddress,
    }

    async fn harness(history: bool, ledger: Arc<dyn Ledger>, fx: Arc<dyn FxRateFeed>) -> Harness {
        let store = MemoryCustodyStore::new();
        let chain = Arc::new(SimulatedChain::new(history));
        let mut chains = ChainClients::new();
        chains.insert("eth-devnet", chain.clone());

        let mut networks = NetworkRegistry::builtin(Deployment::Devnet).list().to_vec();
        for n in networks.iter_mut() {
            n.confirmation_threshold = 3;
        }

        let address = DepositAddress::new("user_1", "eth", "eth-devnet", "0xabc", "kh_test");
        store.insert_address(&address).await.unwrap();

        let watcher = DepositWatcher::new(
            Arc::new(store.clone()),
            Arc::new(NetworkRegistry::new(networks).unwrap()),
            chains,
            ledger,
            fx,
            AddressLocks::new(),
            Duration::from_secs(1),
        );
        Harness {
            watcher,
            store,
            chain,
            address,
        }
    }

    fn fixed_fx() -> Arc<dyn FxRateFeed> {
        Arc::new(FixedRateFeed::devnet())
    }

    #[tokio::test]
    async fn test_delta_confirmation_gating() {
        let ledger = Arc::new(InMemoryLedger::new());
        let h = harness(false, ledger.clone(), fixed_fx()).await;
        h.chain.set_balance("0xabc", 5);

        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.detected, 1);

        for _ in 0..2 {
            h.chain.mine(1);
            h.watcher.poll_address(&h.address.id).await.unwrap();
            let deposits = h.store.deposits_for_address(&h.address.id).await.unwrap();
            assert_ne!(deposits[0].status, DepositTxStatus::Completed);
            assert!(ledger.credits().is_empty());
        }

        h.chain.mine(1);
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(ledger.balance("user_1", "eth"), 5);

        let addr = h.store.get_address(&h.address.id).await.unwrap().unwrap();
        assert_eq!(addr.last_balance, 5);
        assert!(addr.last_used_at.is_some());

        // Further polls do nothing
        h.chain.mine(5);
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report, PollReport::default());
        assert_eq!(ledger.credits().len(), 1);
    }

    #[tokio::test]
    async fn test_delta_drop_fails_and_rebaselines() {
        let ledger = Arc::new(InMemoryLedger::new());
        let h = harness(false, ledger.clone(), fixed_fx()).await;
        h.chain.set_balance("0xabc", 50);
        h.watcher.poll_address(&h.address.id).await.unwrap();

        h.chain.set_balance("0xabc", 20);
        h.chain.mine(1);
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.rebaselined);

        let addr = h.store.get_address(&h.address.id).await.unwrap().unwrap();
        assert_eq!(addr.last_balance, 20);
        assert_eq!(addr.baseline_epoch, 1);
        assert!(ledger.credits().is_empty());
    }

    #[tokio::test]
    async fn test_decrease_without_deposit_is_not_credited() {
        let ledger = Arc::new(InMemoryLedger::new());
        let h = harness(false, ledger.clone(), fixed_fx()).await;
        h.store.rebaseline(&h.address.id, 100).await.unwrap();
        h.chain.set_balance("0xabc", 40);

        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert!(report.rebaselined);
        assert_eq!(report.detected, 0);
        assert_eq!(
            h.store.get_address(&h.address.id).await.unwrap().unwrap().last_balance,
            40
        );
    }

    #[tokio::test]
    async fn test_transfer_mode_credits_each_hash_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let h = harness(true, ledger.clone(), fixed_fx()).await;
        h.chain.deposit("0xabc", 30);
        h.chain.deposit("0xabc", 12);

        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.detected, 2);

        h.chain.mine(3);
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.completed, 2);
        h.watcher.poll_address(&h.address.id).await.unwrap();

        assert_eq!(ledger.credits().len(), 2);
        assert_eq!(ledger.balance("user_1", "eth"), 42);
        assert_eq!(
            h.store.get_address(&h.address.id).await.unwrap().unwrap().last_balance,
            42
        );
    }

    #[tokio::test]
    async fn test_transfer_mode_reorg_fails_deposit() {
        let ledger = Arc::new(InMemoryLedger::new());
        let h = harness(true, ledger.clone(), fixed_fx()).await;
        let hash = h.chain.deposit("0xabc", 30);
        h.watcher.poll_address(&h.address.id).await.unwrap();

        h.chain.reorg_transfer("0xabc", &hash);
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.failed, 1);

        let deposits = h.store.deposits_for_address(&h.address.id).await.unwrap();
        assert_eq!(deposits[0].status, DepositTxStatus::Failed);
        assert!(ledger.credits().is_empty());
    }

    #[tokio::test]
    async fn test_reincluded_transfer_is_credited_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let h = harness(true, ledger.clone(), fixed_fx()).await;
        let hash = h.chain.deposit("0xabc", 30);
        h.watcher.poll_address(&h.address.id).await.unwrap();
        h.chain.reorg_transfer("0xabc", &hash);
        h.watcher.poll_address(&h.address.id).await.unwrap();

        // The same transaction lands again and confirms
        assert!(h.chain.reinclude_transfer("0xabc", &hash));
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.detected, 1);
        h.chain.mine(5);
        for _ in 0..3 {
            h.watcher.poll_address(&h.address.id).await.unwrap();
        }

        let credits = ledger.credits();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].amount, 30);
        assert!(credits[0].idempotency_key.ends_with(":r1"));

        let deposits = h.store.deposits_for_address(&h.address.id).await.unwrap();
        let failed = deposits.iter().filter(|d| d.status == DepositTxStatus::Failed).count();
        let completed = deposits.iter().filter(|d| d.status == DepositTxStatus::Completed).count();
        assert_eq!((failed, completed), (1, 1));
        let addr = h.store.get_address(&h.address.id).await.unwrap().unwrap();
        assert_eq!(addr.last_balance, 30);
    }

    #[tokio::test]
    async fn test_ledger_outage_retries_with_same_key() {
        let mut mock = MockLedger::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_credit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(LedgerError::Unavailable("down".to_string())));
        mock.expect_credit()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|r| r.amount == 5 && r.idempotency_key.contains(":delta:0:0->5"))
            .returning(|_| Ok(CreditOutcome::Applied));

        let h = harness(false, Arc::new(mock), fixed_fx()).await;
        h.chain.set_balance("0xabc", 5);
        h.watcher.poll_address(&h.address.id).await.unwrap();
        h.chain.mine(3);

        let err = h.watcher.poll_address(&h.address.id).await.unwrap_err();
        assert!(err.is_retryable());
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_fx_failure_records_zero_value() {
        let mut fx = MockFxRateFeed::new();
        fx.expect_usd_rate()
            .returning(|_| Err(crate::collaborators::FxError::Unavailable("down".to_string())));

        let h = harness(false, Arc::new(InMemoryLedger::new()), Arc::new(fx)).await;
        h.chain.set_balance("0xabc", 5);
        h.watcher.poll_address(&h.address.id).await.unwrap();

        let deposits = h.store.deposits_for_address(&h.address.id).await.unwrap();
        assert_eq!(deposits[0].usd_value, 0.0);
    }

    #[tokio::test]
    async fn test_unsettled_sweep_is_not_a_deposit() {
        let ledger = Arc::new(InMemoryLedger::new());
        let h = harness(false, ledger.clone(), fixed_fx()).await;
        h.chain.set_balance("0xabc", 100);

        // Swept 100 but the node still reports the old balance
        h.watcher.rebaseline(&h.address.id, 0, 100, 100).await.unwrap();
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report.detected, 0);

        // Sweep mined
        h.chain.set_balance("0xabc", 0);
        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert_eq!(report, PollReport::default());
        assert!(h.watcher.settling.is_empty());
    }

    #[tokio::test]
    async fn test_locked_address_is_skipped() {
        let h = harness(false, Arc::new(InMemoryLedger::new()), fixed_fx()).await;
        let _guard = h.watcher.locks.begin_sweep(&h.address.id).unwrap();
        h.chain.set_balance("0xabc", 5);

        let report = h.watcher.poll_address(&h.address.id).await.unwrap();
        assert!(report.skipped);
        assert!(h.store.deposits_for_address(&h.address.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rpc_failure_propagates() {
        let h = harness(false, Arc::new(InMemoryLedger::new()), fixed_fx()).await;
        h.chain.fail_address("0xabc", true);
        let err = h.watcher.poll_address(&h.address.id).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
