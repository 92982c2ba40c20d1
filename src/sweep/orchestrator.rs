//! Sweep Orchestrator
//!
//! Moves funds from custodial addresses into their network's master wallet.
//! Every requested id gets exactly one [`SweepResult`], in request order; one
//! address failing never affects another.
//!
//! Per address:
//! 1. take the sweep lock ("sweep in progress" when held)
//! 2. resolve address, network, active master wallet
//! 3. wait out any in-flight watcher evaluation, refuse while a deposit is open
//! 4. read balances and quote the fee; report `need_gas` when fees can't be paid
//! 5. sign through the Key Store, submit, re-baseline the watcher
//!
//! Nothing is retried: RPC timeouts end the attempt with an `error` result.

use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::chain::{with_timeout, ChainClients, HandleSigner, SweepPlan};
use crate::common::log_sweep_event;
use crate::deposit::{AddressLocks, DepositWatcher};
use crate::keystore::address::validate_address;
use crate::keystore::KeyStore;
use crate::registry::NetworkRegistry;
use crate::storage::{AddressStore, CustodyStore, DepositTxStore, MasterWalletStore, SweepAuditStore};
use crate::types::{SweepAuditRecord, SweepResult};

pub const MSG_IN_PROGRESS: &str = "sweep in progress";
pub const MSG_NO_MASTER_WALLET: &str = "master wallet not configured";

/// Timeouts applied to sweeps
#[derive(Debug, Clone, Copy)]
pub struct SweepTimeouts {
    /// Bound on each RPC call
    pub rpc: Duration,
    /// Bound on one address from lock to result
    pub per_address: Duration,
}

impl Default for SweepTimeouts {
    fn default() -> Self {
        Self {
            rpc: Duration::from_secs(10),
            per_address: Duration::from_secs(60),
        }
    }
}

pub struct SweepOrchestrator {
    store: Arc<dyn CustodyStore>,
    networks: Arc<NetworkRegistry>,
    chains: ChainClients,
    keystore: Arc<dyn KeyStore>,
    locks: Arc<AddressLocks>,
    watcher: Arc<DepositWatcher>,
    timeouts: SweepTimeouts,
    /// Per-network concurrency bound
    permits: DashMap<String, Arc<Semaphore>>,
}

impl SweepOrchestrator {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        networks: Arc<NetworkRegistry>,
        chains: ChainClients,
        keystore: Arc<dyn KeyStore>,
        locks: Arc<AddressLocks>,
        watcher: Arc<DepositWatcher>,
        timeouts: SweepTimeouts,
    ) -> Self {
        Self {
            store,
            networks,
            chains,
            keystore,
            locks,
            watcher,
            timeouts,
            permits: DashMap::new(),
        }
    }

    /// Sweep a batch; one result per id, in input order
    pub async fn sweep(&self, address_ids: &[String]) -> Vec<SweepResult> {
        let batch_id = format!("batch_{}", uuid::Uuid::new_v4().simple());
        tracing::info!(
            target: "custody::sweep",
            batch_id = %batch_id,
            addresses = address_ids.len(),
            "Sweep batch started"
        );

        let results = join_all(address_ids.iter().map(|id| self.sweep_recorded(&batch_id, id))).await;

        tracing::info!(
            target: "custody::sweep",
            batch_id = %batch_id,
            succeeded = results.iter().filter(|r| r.status == crate::types::SweepStatus::Success).count(),
            "Sweep batch finished"
        );
        results
    }

    async fn sweep_recorded(&self, batch_id: &str, address_id: &str) -> SweepResult {
        let (result, amount) =
            match tokio::time::timeout(self.timeouts.per_address, self.attempt(address_id)).await {
                Ok(outcome) => outcome,
                Err(_) => (
                    SweepResult::error(
                        address_id,
                        format!("sweep timed out after {}s", self.timeouts.per_address.as_secs()),
                    ),
                    None,
                ),
            };

        log_sweep_event(batch_id, &result);
        let record = SweepAuditRecord::new(batch_id, result.clone(), amount);
        if let Err(e) = self.store.record_sweep(&record).await {
            tracing::error!(
                target: "custody::sweep",
                batch_id = %batch_id,
                address_id = %address_id,
                error = %e,
                "Failed to persist sweep audit record"
            );
        }
        result
    }

    fn permits_for(&self, network_id: &str, size: usize) -> Arc<Semaphore> {
        self.permits
            .entry(network_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(size.max(1))))
            .clone()
    }

    /// One address; returns the result and the swept amount
    async fn attempt(&self, address_id: &str) -> (SweepResult, Option<u128>) {
        let Some(guard) = self.locks.begin_sweep(address_id) else {
            return (SweepResult::error(address_id, MSG_IN_PROGRESS), None);
        };

        let address = match self.store.get_address(address_id).await {
            Ok(Some(a)) => a,
            Ok(None) => return (SweepResult::error(address_id, "address not found"), None),
            Err(e) => return (SweepResult::error(address_id, e.to_string()), None),
        };
        let fail = |msg: String| {
            SweepResult::error(address_id, msg)
                .with_address(&address.address)
                .with_network(&address.network_id)
        };

        let network = match self.networks.resolve(&address.asset_id, &address.network_id) {
            Ok(n) => n,
            Err(e) => return (fail(e.to_string()), None),
        };
        let wallet = match self.store.active_master_wallet(&network.id).await {
            Ok(Some(w)) => w,
            Ok(None) => return (fail(MSG_NO_MASTER_WALLET.to_string()), None),
            Err(e) => return (fail(e.to_string()), None),
        };
        if !validate_address(&network.family, &wallet.address) {
            return (fail(format!("invalid master wallet address {}", wallet.address)), None);
        }
        let Some(chain) = self.chains.get(&network.id) else {
            return (fail(format!("no chain client for {}", network.id)), None);
        };

        let permits = self.permits_for(&network.id, network.max_concurrency);
        let Ok(_permit) = permits.acquire_owned().await else {
            return (fail("sweep pool closed".to_string()), None);
        };
        let _gate = guard.exclusive().await;

        // Re-read after any evaluation that finished while we waited
        let address = match self.store.get_address(address_id).await {
            Ok(Some(a)) => a,
            Ok(None) => return (fail("address not found".to_string()), None),
            Err(e) => return (fail(e.to_string()), None),
        };
        match self.store.open_deposits(address_id).await {
            Ok(open) if !open.is_empty() => {
                return (fail("deposit awaiting confirmations".to_string()), None)
            }
            Ok(_) => {}
            Err(e) => return (fail(e.to_string()), None),
        }

        let rpc = self.timeouts.rpc;
        let balance = match with_timeout(rpc, "balance", chain.balance(network, &address.address)).await {
            Ok(b) => b,
            Err(e) => return (fail(e.to_string()), None),
        };

        // Balance-delta networks only move credited value, so anything that
        // arrived since the last poll is still detected afterwards
        let spendable = if chain.supports_transfer_history() {
            balance
        } else {
            balance.min(address.last_balance)
        };
        if spendable == 0 {
            return (fail("nothing to sweep".to_string()), None);
        }

        let fee = match with_timeout(
            rpc,
            "estimate_sweep_fee",
            chain.estimate_sweep_fee(network, &address.address, &wallet.address),
        )
        .await
        {
            Ok(f) => f,
            Err(e) => return (fail(e.to_string()), None),
        };

        let amount = if network.is_token() {
            let native = match with_timeout(
                rpc,
                "native_balance",
                chain.native_balance(network, &address.address),
            )
            .await
            {
                Ok(n) => n,
                Err(e) => return (fail(e.to_string()), None),
            };
            if native < fee.total {
                return (
                    SweepResult::need_gas(address_id, &address.address, &network.id, fee.total),
                    None,
                );
            }
            spendable
        } else {
            if spendable <= fee.total {
                return (
                    SweepResult::need_gas(address_id, &address.address, &network.id, fee.total),
                    None,
                );
            }
            spendable - fee.total
        };

        let plan = SweepPlan {
            from: address.address.clone(),
            to: wallet.address.clone(),
            amount,
            fee,
        };
        let signer = HandleSigner::new(self.keystore.clone(), address.key_handle.clone());
        let tx_hash = match with_timeout(rpc, "submit_sweep", chain.submit_sweep(network, &plan, &signer)).await {
            Ok(h) => h,
            Err(e) => return (fail(e.to_string()), None),
        };

        let outbound = if network.is_token() { amount } else { spendable };
        let new_baseline = address.last_balance.saturating_sub(spendable);
        if let Err(e) = self
            .watcher
            .rebaseline(address_id, new_baseline, balance, outbound)
            .await
        {
            tracing::error!(
                target: "custody::sweep",
                address_id = %address_id,
                tx_hash = %tx_hash,
                error = %e,
                "Sweep submitted but re-baseline failed"
            );
        }

        (
            SweepResult::success(address_id, &address.address, &network.id, tx_hash, amount),
            Some(amount),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChain;
    use crate::collaborators::{FixedRateFeed, InMemoryLedger};
    use crate::common::config::Deployment;
    use crate::keystore::EncryptedKeyStore;
    use crate::storage::MemoryCustodyStore;
    use crate::types::{DepositAddress, DepositTransaction, MasterWallet, SweepStatus};

    const MASTER: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";

    struct Harness {
        orchestrator: SweepOrchestrator,
        store: MemoryCustodyStore,
        chain: Arc<SimulatedChain>,
        keystore: Arc<dyn KeyStore>,
        locks: Arc<AddressLocks>,
    }

    fn harness() -> Harness {
        let store = MemoryCustodyStore::new();
        let chain = Arc::new(SimulatedChain::new(false).with_fee(10));
        let mut chains = ChainClients::new();
        chains.insert("eth-devnet", chain.clone());
        let networks = Arc::new(NetworkRegistry::builtin(Deployment::Devnet));
        let keystore: Arc<dyn KeyStore> = Arc::new(EncryptedKeyStore::ephemeral("pass"));
        let locks = AddressLocks::new();

        let watcher = Arc::new(DepositWatcher::new(
            Arc::new(store.clone()),
            networks.clone(),
            chains.clone(),
            Arc::new(InMemoryLedger::new()),
            Arc::new(FixedRateFeed::devnet()),
            locks.clone(),
            Duration::from_secs(1),
        ));
        let orchestrator = SweepOrchestrator::new(
            Arc::new(store.clone()),
            networks,
            chains,
            keystore.clone(),
            locks.clone(),
            watcher,
            SweepTimeouts::default(),
        );
        Harness {
            orchestrator,
            store,
            chain,
            keystore,
            locks,
        }
    }

    /// Address with `credited` already accounted for
    async fn funded(h: &Harness, user: &str, credited: u128) -> DepositAddress {
        let key = h
            .keystore
            .generate(&crate::types::AddressFamily::Evm { chain_id: 1337 })
            .unwrap();
        let address = DepositAddress::new(user, "eth", "eth-devnet", &key.address, &key.handle);
        h.store.insert_address(&address).await.unwrap();
        if credited > 0 {
            h.store.rebaseline(&address.id, credited).await.unwrap();
            h.chain.set_balance(&key.address, credited);
        }
        address
    }

    async fn with_master(h: &Harness) {
        h.store
            .insert_master_wallet(&MasterWallet::new("eth-devnet", "Treasury", "ETH", MASTER))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_master_wallet() {
        let h = harness();
        let a = funded(&h, "u1", 100).await;
        let results = h.orchestrator.sweep(&[a.id.clone()]).await;
        assert_eq!(results[0].status, SweepStatus::Error);
        assert_eq!(results[0].message, MSG_NO_MASTER_WALLET);
        assert_eq!(results[0].network_id.as_deref(), Some("eth-devnet"));
    }

    #[tokio::test]
    async fn test_success_rebaselines_and_audits() {
        let h = harness();
        with_master(&h).await;
        let a = funded(&h, "u1", 100).await;

        let results = h.orchestrator.sweep(&[a.id.clone()]).await;
        assert_eq!(results[0].status, SweepStatus::Success);
        assert!(results[0].tx_hash.is_some());

        let sent = h.chain.submitted_sweeps();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].amount, 90);
        assert_eq!(sent[0].to, MASTER);

        let addr = h.store.get_address(&a.id).await.unwrap().unwrap();
        assert_eq!(addr.last_balance, 0);

        let audit = h.store.list_sweeps(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].amount, Some(90));
    }

    #[tokio::test]
    async fn test_need_gas_when_fee_exceeds_balance() {
        let h = harness();
        with_master(&h).await;
        let a = funded(&h, "u1", 5).await;

        let results = h.orchestrator.sweep(&[a.id.clone()]).await;
        assert_eq!(results[0].status, SweepStatus::NeedGas);
        assert_eq!(results[0].required_gas, Some(10));
        assert!(h.chain.submitted_sweeps().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_batch_isolation() {
        let h = harness();
        with_master(&h).await;
        let ok = funded(&h, "u1", 100).await;
        let poor = funded(&h, "u2", 3).await;
        let broken = funded(&h, "u3", 100).await;
        h.chain.fail_address(&broken.address, true);

        let ids = vec![ok.id.clone(), "addr_missing".to_string(), poor.id.clone(), broken.id.clone()];
        let results = h.orchestrator.sweep(&ids).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].status, SweepStatus::Success);
        assert_eq!(results[1].status, SweepStatus::Error);
        assert_eq!(results[1].address_id, "addr_missing");
        assert_eq!(results[2].status, SweepStatus::NeedGas);
        assert_eq!(results[3].status, SweepStatus::Error);
        assert_eq!(h.chain.submitted_sweeps().len(), 1);
    }

    #[tokio::test]
    async fn test_locked_address_reports_in_progress() {
        let h = harness();
        with_master(&h).await;
        let a = funded(&h, "u1", 100).await;

        let _held = h.locks.begin_sweep(&a.id).unwrap();
        let results = h.orchestrator.sweep(&[a.id.clone()]).await;
        assert_eq!(results[0].message, MSG_IN_PROGRESS);
        assert!(h.chain.submitted_sweeps().is_empty());
    }

    #[tokio::test]
    async fn test_open_deposit_blocks_sweep() {
        let h = harness();
        with_master(&h).await;
        let a = funded(&h, "u1", 100).await;
        h.store
            .insert_deposit(&DepositTransaction::new(&a.id, 7, 3, "k"))
            .await
            .unwrap();

        let results = h.orchestrator.sweep(&[a.id.clone()]).await;
        assert_eq!(results[0].status, SweepStatus::Error);
        assert!(h.chain.submitted_sweeps().is_empty());
    }

    #[tokio::test]
    async fn test_delta_mode_sweeps_only_credited_value() {
        let h = harness();
        with_master(&h).await;
        let a = funded(&h, "u1", 100).await;
        // 40 arrived after the last poll
        h.chain.set_balance(&a.address, 140);

        let results = h.orchestrator.sweep(&[a.id.clone()]).await;
        assert_eq!(results[0].status, SweepStatus::Success);
        assert_eq!(h.chain.submitted_sweeps()[0].amount, 90);
        assert_eq!(h.chain.balance_of(&a.address), 40);
        assert_eq!(h.store.get_address(&a.id).await.unwrap().unwrap().last_balance, 0);
    }
}
