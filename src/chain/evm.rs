//! EVM JSON-RPC Client
//!
//! Account chains expose no per-address transfer index over plain JSON-RPC,
//! so deposits on EVM networks are detected by balance delta. Sweeps are
//! legacy EIP-155 transactions: a value transfer for the native currency or an
//! ERC-20 `transfer(to, amount)` call for token networks.

use async_trait::async_trait;
use reqwest::Client;
use rlp::RlpStream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{ChainClient, ChainError, DigestSigner, FeeQuote, SweepPlan};
use crate::keystore::address::{keccak256, parse_evm_address};
use crate::types::{AddressFamily, Network};

/// `transfer(address,uint256)`
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `balanceOf(address)`
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Gas limit used for token transfers when the catalog leaves the default
const TOKEN_TRANSFER_GAS: u64 = 65_000;

/// JSON-RPC client for one EVM endpoint
#[derive(Debug)]
pub struct EvmRpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Unsigned legacy transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u128,
    pub data: Vec<u8>,
}

impl EvmRpcClient {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ChainError::Rpc(format!("{} -> HTTP {}", method, resp.status())));
        }

        let parsed: RpcResponse = resp
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(err) = parsed.error {
            return Err(ChainError::Rpc(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }
        parsed
            .result
            .ok_or_else(|| ChainError::InvalidResponse(format!("{}: missing result", method)))
    }

    async fn call_quantity(&self, method: &str, params: Value) -> Result<u128, ChainError> {
        let value = self.call(method, params).await?;
        let s = value
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse(format!("{}: expected hex string", method)))?;
        parse_quantity(s)
    }

    pub async fn gas_price(&self) -> Result<u128, ChainError> {
        self.call_quantity("eth_gasPrice", json!([])).await
    }

    pub async fn pending_nonce(&self, address: &str) -> Result<u64, ChainError> {
        let nonce = self
            .call_quantity("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        u64::try_from(nonce).map_err(|_| ChainError::InvalidResponse("nonce overflow".to_string()))
    }

    async fn token_balance(&self, contract: &str, address: &str) -> Result<u128, ChainError> {
        let owner = parse_evm_address(address)
            .ok_or_else(|| ChainError::InvalidAddress(address.to_string()))?;
        let mut data = BALANCE_OF_SELECTOR.to_vec();
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(&owner);

        let value = self
            .call(
                "eth_call",
                json!([{ "to": contract, "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        let s = value
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse("eth_call: expected hex string".to_string()))?;
        parse_word(s)
    }
}

fn chain_id(network: &Network) -> Result<u64, ChainError> {
    match network.family {
        AddressFamily::Evm { chain_id } => Ok(chain_id),
        AddressFamily::Bitcoin { .. } => Err(ChainError::Unsupported(format!(
            "{} is not an EVM network",
            network.id
        ))),
    }
}

fn gas_limit_for(network: &Network) -> u64 {
    if network.is_token() && network.fee.gas_limit <= 21_000 {
        TOKEN_TRANSFER_GAS
    } else {
        network.fee.gas_limit
    }
}

/// Parse a JSON-RPC hex quantity
pub fn parse_quantity(s: &str) -> Result<u128, ChainError> {
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| ChainError::InvalidResponse(format!("bad quantity: {}", s)))
}

/// Parse a 32-byte ABI word as u128
fn parse_word(s: &str) -> Result<u128, ChainError> {
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.len() > 32 {
        return Err(ChainError::InvalidResponse(format!("balance exceeds u128: {}", s)));
    }
    parse_quantity(trimmed)
}

/// Minimal big-endian encoding, empty for zero
fn be_trimmed(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// ABI-encoded `transfer(to, amount)`
pub fn transfer_call_data(to: &[u8; 20], amount: u128) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to);
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(&amount.to_be_bytes());
    data
}

impl LegacyTx {
    fn append_fields(&self, stream: &mut RlpStream) {
        stream.append(&be_trimmed(self.nonce as u128));
        stream.append(&be_trimmed(self.gas_price));
        stream.append(&be_trimmed(self.gas_limit as u128));
        stream.append(&self.to.to_vec());
        stream.append(&be_trimmed(self.value));
        stream.append(&self.data);
    }

    /// EIP-155 signing digest
    pub fn signing_hash(&self, chain_id: u64) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.append_fields(&mut stream);
        stream.append(&be_trimmed(chain_id as u128));
        stream.append(&Vec::<u8>::new());
        stream.append(&Vec::<u8>::new());
        keccak256(&stream.out())
    }

    /// Sign and RLP-encode for `eth_sendRawTransaction`
    pub fn sign(&self, chain_id: u64, signer: &dyn DigestSigner) -> Result<Vec<u8>, ChainError> {
        let digest = self.signing_hash(chain_id);
        let signature = signer.sign_digest(&digest)?;
        let (recovery_id, compact) = signature.serialize_compact();

        let v = recovery_id.to_i32() as u128 + 35 + 2 * chain_id as u128;

        let mut stream = RlpStream::new_list(9);
        self.append_fields(&mut stream);
        stream.append(&be_trimmed(v));
        stream.append(&trim_leading_zeros(&compact[..32]));
        stream.append(&trim_leading_zeros(&compact[32..]));
        Ok(stream.out().to_vec())
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    async fn tip_height(&self, _network: &Network) -> Result<u64, ChainError> {
        let height = self.call_quantity("eth_blockNumber", json!([])).await?;
        u64::try_from(height).map_err(|_| ChainError::InvalidResponse("height overflow".to_string()))
    }

    async fn balance(&self, network: &Network, address: &str) -> Result<u128, ChainError> {
        match &network.token_contract {
            Some(contract) => self.token_balance(contract, address).await,
            None => self.native_balance(network, address).await,
        }
    }

    async fn native_balance(&self, _network: &Network, address: &str) -> Result<u128, ChainError> {
        self.call_quantity("eth_getBalance", json!([address, "latest"])).await
    }

    async fn estimate_sweep_fee(
        &self,
        network: &Network,
        _from: &str,
        _to: &str,
    ) -> Result<FeeQuote, ChainError> {
        let node_price = self.gas_price().await?;
        let gas_price = node_price.max(network.fee.fee_rate);
        let gas_limit = gas_limit_for(network);
        Ok(FeeQuote {
            total: gas_price * gas_limit as u128,
            gas_price,
            gas_limit,
        })
    }

    async fn submit_sweep(
        &self,
        network: &Network,
        plan: &SweepPlan,
        signer: &dyn DigestSigner,
    ) -> Result<String, ChainError> {
        let chain_id = chain_id(network)?;
        let recipient = parse_evm_address(&plan.to)
            .ok_or_else(|| ChainError::InvalidAddress(plan.to.clone()))?;

        let (to, value, data) = match &network.token_contract {
            Some(contract) => {
                let contract = parse_evm_address(contract)
                    .ok_or_else(|| ChainError::InvalidAddress(contract.clone()))?;
                (contract, 0, transfer_call_data(&recipient, plan.amount))
            }
            None => (recipient, plan.amount, Vec::new()),
        };

        let tx = LegacyTx {
            nonce: self.pending_nonce(&plan.from).await?,
            gas_price: plan.fee.gas_price,
            gas_limit: plan.fee.gas_limit,
            to,
            value,
            data,
        };
        let raw = tx.sign(chain_id, signer)?;

        tracing::debug!(
            target: "custody::sweep",
            from = %plan.from,
            nonce = tx.nonce,
            chain_id,
            "Broadcasting EVM sweep"
        );

        let hash = self
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        hash.as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::InvalidResponse("eth_sendRawTransaction: expected hash".to_string()))
    }
}
