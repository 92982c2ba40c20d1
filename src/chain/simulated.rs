//! In-process chain used by the demo command and the scenario tests
//!
//! Holds balances, inbound transfers and a block height per instance. Tests
//! drive it directly: `deposit` then `mine`, `reorg_transfer` to drop a
//! transaction and `reinclude_transfer` to bring it back, `fail_address` to
//! inject RPC errors.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::{ChainClient, ChainError, DigestSigner, FeeQuote, InboundTransfer, SweepPlan};
use crate::keystore::address::keccak256;
use crate::types::Network;

#[derive(Debug, Clone)]
struct SimTransfer {
    tx_hash: String,
    amount: u128,
    height: Option<u64>,
}

/// A sweep accepted by the simulated chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedSweep {
    pub network_id: String,
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount: u128,
    pub fee: u128,
}

#[derive(Debug, Default)]
struct SimState {
    height: u64,
    balances: HashMap<String, u128>,
    native: HashMap<String, u128>,
    transfers: HashMap<String, Vec<SimTransfer>>,
    reorged: HashMap<String, Vec<SimTransfer>>,
    failing: HashSet<String>,
    unreachable: bool,
    submitted: Vec<SubmittedSweep>,
    next_tx: u64,
}

impl SimState {
    fn check(&self, address: &str) -> Result<(), ChainError> {
        if self.unreachable {
            return Err(ChainError::Request("simulated node unreachable".to_string()));
        }
        if self.failing.contains(address) {
            return Err(ChainError::Rpc(format!("simulated failure for {}", address)));
        }
        Ok(())
    }

    fn next_hash(&mut self, prefix: &str) -> String {
        self.next_tx += 1;
        let digest = keccak256(format!("{}:{}", prefix, self.next_tx).as_bytes());
        format!("0x{}", hex::encode(digest))
    }
}

/// Simulated chain client
#[derive(Debug)]
pub struct SimulatedChain {
    history: bool,
    fee: FeeQuote,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    /// `history` selects transfer-history mode over balance-delta mode
    pub fn new(history: bool) -> Self {
        Self {
            history,
            fee: FeeQuote {
                total: 21_000,
                gas_price: 1,
                gas_limit: 21_000,
            },
            state: Mutex::new(SimState {
                height: 100,
                ..SimState::default()
            }),
        }
    }

    /// Replace the fixed fee quote
    pub fn with_fee(mut self, total: u128) -> Self {
        self.fee = FeeQuote {
            total,
            gas_price: 1,
            gas_limit: u64::try_from(total).unwrap_or(u64::MAX),
        };
        self
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Add an unconfirmed inbound transfer, returning its hash
    pub fn deposit(&self, address: &str, amount: u128) -> String {
        let mut state = self.state.lock();
        let tx_hash = state.next_hash(address);
        *state.balances.entry(address.to_string()).or_default() += amount;
        state
            .transfers
            .entry(address.to_string())
            .or_default()
            .push(SimTransfer {
                tx_hash: tx_hash.clone(),
                amount,
                height: None,
            });
        tx_hash
    }

    /// Mine `blocks` blocks; pending transfers land in the first one
    pub fn mine(&self, blocks: u64) {
        if blocks == 0 {
            return;
        }
        let mut state = self.state.lock();
        let inclusion = state.height + 1;
        for transfers in state.transfers.values_mut() {
            for t in transfers.iter_mut().filter(|t| t.height.is_none()) {
                t.height = Some(inclusion);
            }
        }
        state.height += blocks;
    }

    /// Remove a transfer as a reorg would, returning whether it existed
    pub fn reorg_transfer(&self, address: &str, tx_hash: &str) -> bool {
        let mut state = self.state.lock();
        let removed: Vec<SimTransfer> = match state.transfers.get_mut(address) {
            Some(list) => {
                let (gone, kept): (Vec<SimTransfer>, Vec<SimTransfer>) = list.drain(..).partition(|t| t.tx_hash == tx_hash);
                *list = kept;
                gone
            }
            None => Vec::new(),
        };
        if removed.is_empty() {
            return false;
        }
        let amount: u128 = removed.iter().map(|t| t.amount).sum();
        let balance = state.balances.entry(address.to_string()).or_default();
        *balance = balance.saturating_sub(amount);
        state
            .reorged
            .entry(address.to_string())
            .or_default()
            .extend(removed);
        true
    }

    /// Put a reorganized transfer back as unconfirmed, returning whether it
    /// was found
    pub fn reinclude_transfer(&self, address: &str, tx_hash: &str) -> bool {
        let mut state = self.state.lock();
        let restored: Vec<SimTransfer> = match state.reorged.get_mut(address) {
            Some(list) => {
                let (back, kept): (Vec<SimTransfer>, Vec<SimTransfer>) = list.drain(..).partition(|t| t.tx_hash == tx_hash);
                *list = kept;
                back
            }
            None => Vec::new(),
        };
        if restored.is_empty() {
            return false;
        }
        let amount: u128 = restored.iter().map(|t| t.amount).sum();
        *state.balances.entry(address.to_string()).or_default() += amount;
        state
            .transfers
            .entry(address.to_string())
            .or_default()
            .extend(restored.into_iter().map(|t| SimTransfer { height: None, ..t }));
        true
    }

    /// Overwrite the asset balance
    pub fn set_balance(&self, address: &str, amount: u128) {
        self.state.lock().balances.insert(address.to_string(), amount);
    }

    /// Overwrite the fee-currency balance (token networks)
    pub fn set_native_balance(&self, address: &str, amount: u128) {
        self.state.lock().native.insert(address.to_string(), amount);
    }

    pub fn balance_of(&self, address: &str) -> u128 {
        self.state.lock().balances.get(address).copied().unwrap_or(0)
    }

    /// Make every call touching `address` fail
    pub fn fail_address(&self, address: &str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(address.to_string());
        } else {
            state.failing.remove(address);
        }
    }

    /// Make every call fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn submitted_sweeps(&self) -> Vec<SubmittedSweep> {
        self.state.lock().submitted.clone()
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn supports_transfer_history(&self) -> bool {
        self.history
    }

    async fn tip_height(&self, _network: &Network) -> Result<u64, ChainError> {
        let state = self.state.lock();
        if state.unreachable {
            return Err(ChainError::Request("simulated node unreachable".to_string()));
        }
        Ok(state.height)
    }

    async fn balance(&self, _network: &Network, address: &str) -> Result<u128, ChainError> {
        let state = self.state.lock();
        state.check(address)?;
        Ok(state.balances.get(address).copied().unwrap_or(0))
    }

    async fn native_balance(&self, network: &Network, address: &str) -> Result<u128, ChainError> {
        let state = self.state.lock();
        state.check(address)?;
        let map = if network.is_token() {
            &state.native
        } else {
            &state.balances
        };
        Ok(map.get(address).copied().unwrap_or(0))
    }

    async fn inbound_transfers(
        &self,
        network: &Network,
        address: &str,
    ) -> Result<Vec<InboundTransfer>, ChainError> {
        if !self.history {
            return Err(ChainError::Unsupported(format!(
                "{} has no transfer history",
                network.id
            )));
        }
        let state = self.state.lock();
        state.check(address)?;
        let tip = state.height;
        Ok(state
            .transfers
            .get(address)
            .map(|list| {
                list.iter()
                    .rev()
                    .map(|t| InboundTransfer {
                        tx_hash: t.tx_hash.clone(),
                        amount: t.amount,
                        block_height: t.height,
                        confirmations: t
                            .height
                            .map(|h| (tip.saturating_sub(h) + 1) as u32)
                            .unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn estimate_sweep_fee(
        &self,
        _network: &Network,
        from: &str,
        _to: &str,
    ) -> Result<FeeQuote, ChainError> {
        self.state.lock().check(from)?;
        Ok(self.fee)
    }

    async fn submit_sweep(
        &self,
        network: &Network,
        plan: &SweepPlan,
        signer: &dyn DigestSigner,
    ) -> Result<String, ChainError> {
        self.state.lock().check(&plan.from)?;

        let payload = format!("{}:{}:{}:{}", network.id, plan.from, plan.to, plan.amount);
        signer.sign_digest(&keccak256(payload.as_bytes()))?;

        let mut state = self.state.lock();
        let balance = state.balances.get(&plan.from).copied().unwrap_or(0);
        let asset_debit = if network.is_token() {
            plan.amount
        } else {
            plan.amount + plan.fee.total
        };
        if balance < asset_debit {
            return Err(ChainError::Rpc("insufficient funds".to_string()));
        }
        if network.is_token() {
            let native = state.native.get(&plan.from).copied().unwrap_or(0);
            if native < plan.fee.total {
                return Err(ChainError::Rpc("insufficient funds for gas".to_string()));
            }
            state.native.insert(plan.from.clone(), native - plan.fee.total);
        }
        state.balances.insert(plan.from.clone(), balance - asset_debit);
        *state.balances.entry(plan.to.clone()).or_default() += plan.amount;

        let tx_hash = state.next_hash(&plan.from);
        state.submitted.push(SubmittedSweep {
            network_id: network.id.clone(),
            tx_hash: tx_hash.clone(),
            from: plan.from.clone(),
            to: plan.to.clone(),
            amount: plan.amount,
            fee: plan.fee.total,
        });
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressFamily, FeeSchedule};

    fn network() -> Network {
        Network {
            id: "sim".to_string(),
            asset_id: "eth".to_string(),
            family: AddressFamily::Evm { chain_id: 1337 },
            native_symbol: "ETH".to_string(),
            token_contract: None,
            decimals: 18,
            confirmation_threshold: 3,
            min_deposit: 1,
            fee: FeeSchedule::default(),
            rpc_url: "sim://local".to_string(),
            block_time_secs: 1,
            max_concurrency: 5,
            active: true,
        }
    }

    #[tokio::test]
    async fn test_deposit_and_mine() {
        let chain = SimulatedChain::new(true);
        let net = network();
        let hash = chain.deposit("addr", 500);

        let transfers = chain.inbound_transfers(&net, "addr").await.unwrap();
        assert_eq!(transfers[0].tx_hash, hash);
        assert_eq!(transfers[0].confirmations, 0);

        chain.mine(3);
        let transfers = chain.inbound_transfers(&net, "addr").await.unwrap();
        assert_eq!(transfers[0].confirmations, 3);
        assert_eq!(chain.balance(&net, "addr").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_reorg_removes_value() {
        let chain = SimulatedChain::new(true);
        let hash = chain.deposit("addr", 500);
        assert!(chain.reorg_transfer("addr", &hash));
        assert!(!chain.reorg_transfer("addr", &hash));
        assert_eq!(chain.balance_of("addr"), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let chain = SimulatedChain::new(false);
        let net = network();
        chain.fail_address("addr", true);
        assert!(chain.balance(&net, "addr").await.is_err());
        assert!(chain.balance(&net, "other").await.is_ok());

        chain.fail_address("addr", false);
        chain.set_unreachable(true);
        assert!(chain.tip_height(&net).await.is_err());
        assert!(chain.inbound_transfers(&net, "addr").await.is_err());
    }
}
