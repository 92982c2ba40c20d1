//! Chain Clients
//!
//! One [`ChainClient`] per network answers balance, history and fee queries
//! and submits signed sweep transactions. Two detection modes follow from
//! what the client can see:
//!
//! - transfer history (`supports_transfer_history() == true`): every inbound
//!   transaction is listed with its hash and confirmations (Esplora)
//! - balance delta: only the current balance is visible (EVM JSON-RPC)
//!
//! Signing goes through a [`DigestSigner`], so clients never see key material.

pub mod esplora;
pub mod evm;
pub mod simulated;

use async_trait::async_trait;
use secp256k1::{ecdsa::RecoverableSignature, PublicKey};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::keystore::KeyStore;
use crate::types::Network;

pub use esplora::EsploraClient;
pub use evm::EvmRpcClient;
pub use simulated::SimulatedChain;

/// Chain client errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timed out: {0}")]
    Timeout(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("failed to build transaction: {0}")]
    Build(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout(e.to_string())
        } else {
            ChainError::Request(e.to_string())
        }
    }
}

/// One inbound transaction seen on a deposit address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTransfer {
    pub tx_hash: String,
    /// Value received by the address in this transaction
    pub amount: u128,
    /// Block height, None while unconfirmed
    pub block_height: Option<u64>,
    pub confirmations: u32,
}

/// Fee estimate for one sweep, in native base units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub total: u128,
    /// sat/vB or wei per gas
    pub gas_price: u128,
    /// vbytes or gas units
    pub gas_limit: u64,
}

/// A fully priced sweep ready for signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub from: String,
    pub to: String,
    /// Asset amount delivered to `to`
    pub amount: u128,
    pub fee: FeeQuote,
}

/// Signs digests for one custodial address
pub trait DigestSigner: Send + Sync {
    fn public_key(&self) -> Result<PublicKey, ChainError>;

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<RecoverableSignature, ChainError>;
}

/// [`DigestSigner`] backed by a Key Store handle
pub struct HandleSigner {
    keystore: Arc<dyn KeyStore>,
    handle: String,
}

impl HandleSigner {
    pub fn new(keystore: Arc<dyn KeyStore>, handle: impl Into<String>) -> Self {
        Self {
            keystore,
            handle: handle.into(),
        }
    }
}

impl DigestSigner for HandleSigner {
    fn public_key(&self) -> Result<PublicKey, ChainError> {
        self.keystore
            .public_key(&self.handle)
            .map_err(|e| ChainError::Signing(e.to_string()))
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<RecoverableSignature, ChainError> {
        self.keystore
            .sign(&self.handle, digest)
            .map_err(|e| ChainError::Signing(e.to_string()))
    }
}

/// Read and write access to one blockchain
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Whether `inbound_transfers` is available
    fn supports_transfer_history(&self) -> bool {
        false
    }

    async fn tip_height(&self, network: &Network) -> Result<u64, ChainError>;

    /// Balance of the network's asset (token balance on token networks)
    async fn balance(&self, network: &Network, address: &str) -> Result<u128, ChainError>;

    /// Balance of the fee-paying currency
    async fn native_balance(&self, network: &Network, address: &str) -> Result<u128, ChainError>;

    /// Inbound transactions, newest first
    async fn inbound_transfers(
        &self,
        network: &Network,
        _address: &str,
    ) -> Result<Vec<InboundTransfer>, ChainError> {
        Err(ChainError::Unsupported(format!(
            "{} has no transfer history",
            network.id
        )))
    }

    /// Price a sweep of `from` into `to`
    async fn estimate_sweep_fee(
        &self,
        network: &Network,
        from: &str,
        to: &str,
    ) -> Result<FeeQuote, ChainError>;

    /// Sign and broadcast a sweep, returning the transaction hash
    async fn submit_sweep(
        &self,
        network: &Network,
        plan: &SweepPlan,
        signer: &dyn DigestSigner,
    ) -> Result<String, ChainError>;
}

/// Chain clients keyed by network id
#[derive(Clone, Default)]
pub struct ChainClients {
    clients: HashMap<String, Arc<dyn ChainClient>>,
}

impl ChainClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the client each network's family calls for
    pub fn for_networks<'a>(
        networks: impl IntoIterator<Item = &'a Network>,
        rpc_timeout: std::time::Duration,
    ) -> Self {
        let mut clients = Self::new();
        for network in networks {
            if clients.clients.contains_key(&network.id) {
                continue;
            }
            let client: Arc<dyn ChainClient> = if network.is_evm() {
                Arc::new(EvmRpcClient::new(&network.rpc_url, rpc_timeout))
            } else {
                Arc::new(EsploraClient::new(&network.rpc_url, rpc_timeout))
            };
            clients.clients.insert(network.id.clone(), client);
        }
        clients
    }

    /// Register or replace the client for a network
    pub fn insert(&mut self, network_id: impl Into<String>, client: Arc<dyn ChainClient>) {
        self.clients.insert(network_id.into(), client);
    }

    pub fn get(&self, network_id: &str) -> Option<Arc<dyn ChainClient>> {
        self.clients.get(network_id).cloned()
    }
}

/// Bound an RPC future by `timeout`
pub async fn with_timeout<T, F>(timeout: std::time::Duration, what: &str, fut: F) -> Result<T, ChainError>
where
    F: std::future::Future<Output = Result<T, ChainError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout(format!(
            "{} after {}ms",
            what,
            timeout.as_millis()
        ))),
    }
}
