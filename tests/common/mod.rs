//! Shared scenario harness: simulated chains, in-memory store and ledger

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use custody::chain::{ChainClients, SimulatedChain};
use custody::collaborators::{FixedRateFeed, InMemoryLedger};
use custody::common::CustodyConfig;
use custody::keystore::{EncryptedKeyStore, KeyStore};
use custody::registry::NetworkRegistry;
use custody::storage::{CustodyStore, MemoryCustodyStore};
use custody::types::DepositAddress;
use custody::{Backends, CustodyServices};

pub const EVM_MASTER: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";
pub const BTC_MASTER: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";
pub const EVM_FEE: u128 = 21_000;

/// `evm-test` carries eth (native) and usdc (token) in balance-delta mode;
/// `btc-test` has transfer history.
pub const CATALOG: &str = r#"
    [[networks]]
    id = "evm-test"
    asset_id = "eth"
    family = { kind = "evm", chain_id = 1337 }
    native_symbol = "ETH"
    decimals = 18
    confirmation_threshold = 3
    min_deposit = 1
    rpc_url = "http://localhost:8545"
    block_time_secs = 1

    [[networks]]
    id = "evm-test"
    asset_id = "usdc"
    family = { kind = "evm", chain_id = 1337 }
    native_symbol = "ETH"
    token_contract = "0x1c7d4b196cb0c7b01d743fbc6116a902379c7238"
    decimals = 6
    confirmation_threshold = 3
    min_deposit = 1
    rpc_url = "http://localhost:8545"
    block_time_secs = 1

    [[networks]]
    id = "btc-test"
    asset_id = "btc"
    family = { kind = "bitcoin", network = "regtest" }
    native_symbol = "BTC"
    decimals = 8
    confirmation_threshold = 1
    min_deposit = 1000
    rpc_url = "http://localhost:3000"
    block_time_secs = 1
"#;

pub struct Scenario {
    pub services: CustodyServices,
    pub store: Arc<dyn CustodyStore>,
    pub keystore: Arc<dyn KeyStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub evm: Arc<SimulatedChain>,
    pub btc: Arc<SimulatedChain>,
    networks: Arc<NetworkRegistry>,
    chains: ChainClients,
}

pub fn config() -> CustodyConfig {
    let mut config = CustodyConfig::devnet();
    config.rpc_timeout = Duration::from_secs(2);
    config.sweep_timeout = Duration::from_secs(5);
    config.poll_factor = 0.1;
    config.operator_tokens = vec!["op-token".to_string()];
    config
}

pub fn scenario() -> Scenario {
    let networks = Arc::new(NetworkRegistry::from_toml_str(CATALOG).expect("catalog"));
    let evm = Arc::new(SimulatedChain::new(false).with_fee(EVM_FEE));
    let btc = Arc::new(SimulatedChain::new(true).with_fee(500));
    let mut chains = ChainClients::new();
    chains.insert("evm-test", evm.clone());
    chains.insert("btc-test", btc.clone());

    let store: Arc<dyn CustodyStore> = Arc::new(MemoryCustodyStore::new());
    let keystore: Arc<dyn KeyStore> = Arc::new(EncryptedKeyStore::ephemeral("scenario"));
    let ledger = Arc::new(InMemoryLedger::new());

    let services = CustodyServices::assemble(
        config(),
        Backends {
            networks: networks.clone(),
            store: store.clone(),
            keystore: keystore.clone(),
            chains: chains.clone(),
            ledger: ledger.clone(),
            fx: Arc::new(FixedRateFeed::devnet()),
        },
    );

    Scenario {
        services,
        store,
        keystore,
        ledger,
        evm,
        btc,
        networks,
        chains,
    }
}

impl Scenario {
    /// Fresh services over the same store, key store, chains and ledger,
    /// as after a process restart
    pub fn restart(&self) -> CustodyServices {
        CustodyServices::assemble(
            config(),
            Backends {
                networks: self.networks.clone(),
                store: self.store.clone(),
                keystore: self.keystore.clone(),
                chains: self.chains.clone(),
                ledger: self.ledger.clone(),
                fx: Arc::new(FixedRateFeed::devnet()),
            },
        )
    }

    pub async fn address(&self, user: &str, asset: &str, network: &str) -> DepositAddress {
        self.services
            .addresses
            .get_or_create_address(user, asset, network)
            .await
            .expect("provision")
            .address
    }

    pub async fn poll(&self, address: &DepositAddress) -> custody::PollReport {
        self.services
            .watcher
            .poll_address(&address.id)
            .await
            .expect("poll")
    }

    pub async fn master_wallets(&self) {
        self.services
            .wallets
            .create("evm-test", "Treasury", "ETH", EVM_MASTER)
            .await
            .expect("evm master wallet");
        self.services
            .wallets
            .create("btc-test", "Treasury", "BTC", BTC_MASTER)
            .await
            .expect("btc master wallet");
    }

    /// Deposit into a balance-delta address and confirm it
    pub async fn credit_evm(&self, address: &DepositAddress, amount: u128) {
        let before = self.evm.balance_of(&address.address);
        self.evm.set_balance(&address.address, before + amount);
        self.poll(address).await;
        self.evm.mine(3);
        let report = self.poll(address).await;
        assert_eq!(report.completed, 1, "deposit should complete");
    }
}
