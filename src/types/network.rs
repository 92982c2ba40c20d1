//! Network Catalog Types
//!
//! A [`Network`] is one (asset, chain) pairing the service can issue deposit
//! addresses on. Token networks (`token_contract` set) sweep a token whose
//! fees are paid in the chain's native currency.

use serde::{Deserialize, Serialize};

/// Bitcoin network used for bech32 address encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitcoinNetwork {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl From<BitcoinNetwork> for bitcoin::Network {
    fn from(n: BitcoinNetwork) -> Self {
        match n {
            BitcoinNetwork::Mainnet => bitcoin::Network::Bitcoin,
            BitcoinNetwork::Testnet => bitcoin::Network::Testnet,
            BitcoinNetwork::Signet => bitcoin::Network::Signet,
            BitcoinNetwork::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// Key and address scheme of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AddressFamily {
    /// UTXO chain, P2WPKH addresses
    Bitcoin { network: BitcoinNetwork },
    /// Account chain, Keccak-derived 20-byte addresses
    Evm { chain_id: u64 },
}

impl AddressFamily {
    pub fn name(&self) -> &'static str {
        match self {
            AddressFamily::Bitcoin { .. } => "bitcoin",
            AddressFamily::Evm { .. } => "evm",
        }
    }
}

/// Fee parameters used when quoting a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// sat/vB for bitcoin; gas price floor in wei for EVM (0 = ask the node)
    #[serde(default, deserialize_with = "crate::types::units::de_amount")]
    pub fee_rate: u128,
    /// Gas limit of a sweep transaction (EVM only)
    #[serde(default)]
    pub gas_limit: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            fee_rate: 0,
            gas_limit: 21_000,
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// One supported (asset, chain) pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Stable network id, e.g. "eth-mainnet"
    pub id: String,
    /// Parent asset id, e.g. "usdc"
    pub asset_id: String,
    pub family: AddressFamily,
    /// Symbol of the currency that pays fees
    pub native_symbol: String,
    /// Token contract for token networks
    #[serde(default)]
    pub token_contract: Option<String>,
    pub decimals: u8,
    pub confirmation_threshold: u32,
    /// Minimum amount (base units) that creates a deposit
    #[serde(default, deserialize_with = "crate::types::units::de_amount")]
    pub min_deposit: u128,
    #[serde(default)]
    pub fee: FeeSchedule,
    pub rpc_url: String,
    /// Expected block interval, drives the poll interval
    pub block_time_secs: u64,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Network {
    /// True when the swept asset differs from the fee currency
    pub fn is_token(&self) -> bool {
        self.token_contract.is_some()
    }

    pub fn is_evm(&self) -> bool {
        matches!(self.family, AddressFamily::Evm { .. })
    }
}
