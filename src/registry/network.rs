//! Network Registry
//!
//! Read-mostly catalog of supported (asset, network) pairings. Loaded once at
//! startup from the built-in catalog for the deployment or from a TOML file:
//!
//! ```toml
//! [[networks]]
//! id = "btc-testnet"
//! asset_id = "btc"
//! family = { kind = "bitcoin", network = "testnet" }
//! native_symbol = "BTC"
//! decimals = 8
//! confirmation_threshold = 2
//! min_deposit = 10000
//! rpc_url = "https://blockstream.info/testnet/api"
//! block_time_secs = 600
//! ```

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::common::config::Deployment;
use crate::common::error::{CustodyError, Result};
use crate::keystore::address::validate_address;
use crate::types::{AddressFamily, BitcoinNetwork, FeeSchedule, Network};

/// Catalog file layout
#[derive(Debug, Deserialize)]
struct CatalogFile {
    networks: Vec<Network>,
}

/// Catalog of supported networks
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: Vec<Network>,
}

fn bitcoin(
    id: &str,
    network: BitcoinNetwork,
    threshold: u32,
    min_deposit: u128,
    rpc_url: &str,
    block_time_secs: u64,
) -> Network {
    Network {
        id: id.to_string(),
        asset_id: "btc".to_string(),
        family: AddressFamily::Bitcoin { network },
        native_symbol: "BTC".to_string(),
        token_contract: None,
        decimals: 8,
        confirmation_threshold: threshold,
        min_deposit,
        fee: FeeSchedule {
            fee_rate: 0,
            gas_limit: 0,
        },
        rpc_url: rpc_url.to_string(),
        block_time_secs,
        max_concurrency: 5,
        active: true,
    }
}

fn evm(
    id: &str,
    asset_id: &str,
    chain_id: u64,
    token: Option<(&str, u8)>,
    threshold: u32,
    min_deposit: u128,
    rpc_url: &str,
) -> Network {
    Network {
        id: id.to_string(),
        asset_id: asset_id.to_string(),
        family: AddressFamily::Evm { chain_id },
        native_symbol: "ETH".to_string(),
        token_contract: token.map(|(c, _)| c.to_string()),
        decimals: token.map(|(_, d)| d).unwrap_or(18),
        confirmation_threshold: threshold,
        min_deposit,
        fee: FeeSchedule {
            fee_rate: 0,
            gas_limit: if token.is_some() { 65_000 } else { 21_000 },
        },
        rpc_url: rpc_url.to_string(),
        block_time_secs: 12,
        max_concurrency: 5,
        active: true,
    }
}

impl NetworkRegistry {
    pub fn new(networks: Vec<Network>) -> Result<Self> {
        let registry = Self { networks };
        registry.validate()?;
        Ok(registry)
    }

    /// Built-in catalog for a deployment
    pub fn builtin(deployment: Deployment) -> Self {
        let networks = match deployment {
            Deployment::Mainnet => vec![
                bitcoin(
                    "btc-mainnet",
                    BitcoinNetwork::Mainnet,
                    3,
                    10_000,
                    "https://blockstream.info/api",
                    600,
                ),
                evm("eth-mainnet", "eth", 1, None, 12, 1_000_000_000_000_000, "https://cloudflare-eth.com"),
                evm(
                    "eth-mainnet",
                    "usdc",
                    1,
                    Some(("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6)),
                    12,
                    1_000_000,
                    "https://cloudflare-eth.com",
                ),
            ],
            Deployment::Testnet => vec![
                bitcoin(
                    "btc-testnet",
                    BitcoinNetwork::Testnet,
                    2,
                    10_000,
                    "https://blockstream.info/testnet/api",
                    600,
                ),
                evm("eth-sepolia", "eth", 11_155_111, None, 6, 1_000_000_000_000_000, "https://rpc.sepolia.org"),
                evm(
                    "eth-sepolia",
                    "usdc",
                    11_155_111,
                    Some(("0x1c7d4b196cb0c7b01d743fbc6116a902379c7238", 6)),
                    6,
                    1_000_000,
                    "https://rpc.sepolia.org",
                ),
            ],
            Deployment::Devnet => vec![
                bitcoin(
                    "btc-regtest",
                    BitcoinNetwork::Regtest,
                    1,
                    1_000,
                    "http://localhost:3000",
                    10,
                ),
                evm("eth-devnet", "eth", 1337, None, 1, 1, "http://localhost:8545"),
            ],
        };
        Self { networks }
    }

    /// Load and validate a TOML catalog
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| match e {
            CustodyError::Validation(msg) => {
                CustodyError::Validation(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(text).map_err(|e| CustodyError::validation(e.to_string()))?;
        Self::new(file.networks)
    }

    /// Check every entry and reject duplicate (asset, network) pairs
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for n in &self.networks {
            if n.id.trim().is_empty() || n.asset_id.trim().is_empty() {
                return Err(CustodyError::validation("network and asset ids must be set"));
            }
            if !seen.insert((n.asset_id.as_str(), n.id.as_str())) {
                return Err(CustodyError::validation(format!(
                    "duplicate catalog entry {}/{}",
                    n.asset_id, n.id
                )));
            }
            if n.confirmation_threshold == 0 {
                return Err(CustodyError::validation(format!(
                    "{}: confirmation_threshold must be at least 1",
                    n.id
                )));
            }
            if n.rpc_url.trim().is_empty() {
                return Err(CustodyError::validation(format!("{}: rpc_url is empty", n.id)));
            }
            if n.max_concurrency == 0 {
                return Err(CustodyError::validation(format!(
                    "{}: max_concurrency must be positive",
                    n.id
                )));
            }
            if n.block_time_secs == 0 {
                return Err(CustodyError::validation(format!(
                    "{}: block_time_secs must be positive",
                    n.id
                )));
            }
            if let Some(contract) = &n.token_contract {
                if !n.is_evm() {
                    return Err(CustodyError::validation(format!(
                        "{}: token contracts require an EVM network",
                        n.id
                    )));
                }
                if !validate_address(&n.family, contract) {
                    return Err(CustodyError::validation(format!(
                        "{}: malformed token contract {}",
                        n.id, contract
                    )));
                }
            }
        }

        // Entries sharing a network id must agree on the chain
        for n in &self.networks {
            if let Some(other) = self
                .networks
                .iter()
                .find(|o| o.id == n.id && (o.family != n.family || o.rpc_url != n.rpc_url))
            {
                return Err(CustodyError::validation(format!(
                    "{}: entries for {} and {} disagree on family or rpc_url",
                    n.id, n.asset_id, other.asset_id
                )));
            }
        }
        Ok(())
    }

    /// Resolve an (asset, network) pair
    pub fn resolve(&self, asset_id: &str, network_id: &str) -> Result<&Network> {
        self.networks
            .iter()
            .find(|n| n.asset_id == asset_id && n.id == network_id)
            .ok_or_else(|| {
                CustodyError::not_found(format!("network {} for asset {}", network_id, asset_id))
            })
    }

    /// Any entry of a network id; all entries share family and endpoint
    pub fn chain(&self, network_id: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.id == network_id)
    }

    /// All entries on one network
    pub fn entries_for_network<'a>(&'a self, network_id: &'a str) -> impl Iterator<Item = &'a Network> + 'a {
        self.networks.iter().filter(move |n| n.id == network_id)
    }

    /// Distinct ids of networks with at least one active entry
    pub fn network_ids(&self) -> Vec<String> {
        self.networks
            .iter()
            .filter(|n| n.active)
            .map(|n| n.id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn list(&self) -> &[Network] {
        &self.networks
    }
}
