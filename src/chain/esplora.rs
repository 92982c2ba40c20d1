//! Esplora Client for Bitcoin-family Networks
//!
//! Polls an Esplora HTTP API for balances, UTXOs and per-address transaction
//! history, and sweeps P2WPKH deposit addresses.
//!
//! # Sweep
//! Spends every UTXO of the deposit address into a single output paying the
//! master wallet. Each input is signed with a SegWit v0 sighash through the
//! [`DigestSigner`], so the private key never leaves the Key Store.

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    address::NetworkUnchecked,
    hashes::Hash,
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use reqwest::Client;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use super::{ChainClient, ChainError, DigestSigner, FeeQuote, InboundTransfer, SweepPlan};
use crate::types::{AddressFamily, Network};

/// Esplora API endpoints
pub const MAINNET_URL: &str = "https://blockstream.info/api";
pub const TESTNET_URL: &str = "https://blockstream.info/testnet/api";

/// Outputs below this are non-standard
const DUST_LIMIT_SATS: u128 = 546;

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

/// Unspent output as returned by `/address/:addr/utxo`
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: EsploraTxStatus,
}

/// Transaction status
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    vout: Vec<EsploraVout>,
    status: EsploraTxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraAddressInfo {
    chain_stats: EsploraStats,
    mempool_stats: EsploraStats,
}

#[derive(Debug, Deserialize)]
struct EsploraStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

impl EsploraClient {
    /// Create a new client with custom URL
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a client for Bitcoin mainnet
    pub fn new_mainnet() -> Self {
        Self::new(MAINNET_URL, Duration::from_secs(10))
    }

    /// Create a client for Bitcoin testnet
    pub fn new_testnet() -> Self {
        Self::new(TESTNET_URL, Duration::from_secs(10))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, path: &str) -> Result<String, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ChainError::Rpc(format!("GET {} -> {}", path, resp.status())));
        }
        Ok(resp.text().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let text = self.get_text(path).await?;
        serde_json::from_str(&text)
            .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", path, e)))
    }

    /// Get current block height
    pub async fn get_block_height(&self) -> Result<u64, ChainError> {
        self.get_text("/blocks/tip/height")
            .await?
            .trim()
            .parse()
            .map_err(|_| ChainError::InvalidResponse("Failed to parse block height".to_string()))
    }

    /// Unspent outputs of an address
    pub async fn get_utxos(&self, address: &str) -> Result<Vec<EsploraUtxo>, ChainError> {
        self.get_json(&format!("/address/{}/utxo", address)).await
    }

    /// Fee rate (sat/vB) for confirmation within ~6 blocks
    pub async fn get_fee_rate(&self) -> Result<u128, ChainError> {
        let estimates: std::collections::HashMap<String, f64> =
            self.get_json("/fee-estimates").await?;
        let rate = estimates.get("6").copied().unwrap_or(1.0);
        Ok(rate.ceil().max(1.0) as u128)
    }

    /// Broadcast a raw transaction
    pub async fn broadcast_tx(&self, tx_hex: &str) -> Result<String, ChainError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self.client.post(&url).body(tx_hex.to_string()).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(ChainError::Rpc(format!("broadcast failed: {}", error_text)));
        }

        Ok(resp.text().await?.trim().to_string())
    }

    async fn fee_rate_for(&self, network: &Network) -> Result<u128, ChainError> {
        if network.fee.fee_rate > 0 {
            Ok(network.fee.fee_rate)
        } else {
            self.get_fee_rate().await
        }
    }
}

/// Approximate vsize of a P2WPKH sweep with `inputs` inputs and one output
pub fn sweep_vsize(inputs: usize) -> u64 {
    // overhead + 68 vB per P2WPKH input + a P2TR-sized output
    11 + 68 * inputs as u64 + 43
}

fn bitcoin_network(network: &Network) -> Result<bitcoin::Network, ChainError> {
    match network.family {
        AddressFamily::Bitcoin { network } => Ok(network.into()),
        AddressFamily::Evm { .. } => Err(ChainError::Unsupported(format!(
            "{} is not a bitcoin network",
            network.id
        ))),
    }
}

/// Build and sign a P2WPKH sweep spending `utxos` into `to`
pub fn build_sweep_tx(
    utxos: &[EsploraUtxo],
    to: &Address,
    amount: u128,
    signer: &dyn DigestSigner,
) -> Result<Transaction, ChainError> {
    let public_key = signer.public_key()?;
    let compressed = CompressedPublicKey(public_key);
    let script_pubkey = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());

    let send = u64::try_from(amount).map_err(|_| ChainError::Build("amount overflow".to_string()))?;

    let input = utxos
        .iter()
        .map(|u| {
            Ok(TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_str(&u.txid).map_err(|e| ChainError::Build(e.to_string()))?,
                    vout: u.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
        })
        .collect::<Result<Vec<_>, ChainError>>()?;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output: vec![TxOut {
            value: Amount::from_sat(send),
            script_pubkey: to.script_pubkey(),
        }],
    };

    let mut sighashes = Vec::with_capacity(utxos.len());
    {
        let mut cache = SighashCache::new(&tx);
        for (i, utxo) in utxos.iter().enumerate() {
            let sighash = cache
                .p2wpkh_signature_hash(
                    i,
                    &script_pubkey,
                    Amount::from_sat(utxo.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| ChainError::Signing(format!("sighash failed: {}", e)))?;
            sighashes.push(sighash.to_byte_array());
        }
    }

    for (i, digest) in sighashes.iter().enumerate() {
        let signature = signer.sign_digest(digest)?.to_standard();
        let ecdsa_sig = bitcoin::ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        };
        tx.input[i].witness = Witness::p2wpkh(&ecdsa_sig, &public_key);
    }

    Ok(tx)
}

#[async_trait]
impl ChainClient for EsploraClient {
    fn supports_transfer_history(&self) -> bool {
        true
    }

    async fn tip_height(&self, _network: &Network) -> Result<u64, ChainError> {
        self.get_block_height().await
    }

    async fn balance(&self, _network: &Network, address: &str) -> Result<u128, ChainError> {
        let info: EsploraAddressInfo = self.get_json(&format!("/address/{}", address)).await?;
        let funded = info.chain_stats.funded_txo_sum as u128 + info.mempool_stats.funded_txo_sum as u128;
        let spent = info.chain_stats.spent_txo_sum as u128 + info.mempool_stats.spent_txo_sum as u128;
        Ok(funded.saturating_sub(spent))
    }

    async fn native_balance(&self, network: &Network, address: &str) -> Result<u128, ChainError> {
        self.balance(network, address).await
    }

    async fn inbound_transfers(
        &self,
        _network: &Network,
        address: &str,
    ) -> Result<Vec<InboundTransfer>, ChainError> {
        let txs: Vec<EsploraTx> = self.get_json(&format!("/address/{}/txs", address)).await?;
        let tip = self.get_block_height().await?;

        Ok(txs
            .into_iter()
            .filter_map(|tx| {
                let amount: u128 = tx
                    .vout
                    .iter()
                    .filter(|o| o.scriptpubkey_address.as_deref() == Some(address))
                    .map(|o| o.value as u128)
                    .sum();
                if amount == 0 {
                    return None;
                }
                let (block_height, confirmations) = match (tx.status.confirmed, tx.status.block_height) {
                    (true, Some(h)) => (Some(h), (tip.saturating_sub(h) + 1) as u32),
                    _ => (None, 0),
                };
                Some(InboundTransfer {
                    tx_hash: tx.txid,
                    amount,
                    block_height,
                    confirmations,
                })
            })
            .collect())
    }

    async fn estimate_sweep_fee(
        &self,
        network: &Network,
        from: &str,
        _to: &str,
    ) -> Result<FeeQuote, ChainError> {
        let utxos = self.get_utxos(from).await?;
        let rate = self.fee_rate_for(network).await?;
        let vsize = sweep_vsize(utxos.len().max(1));
        Ok(FeeQuote {
            total: rate * vsize as u128,
            gas_price: rate,
            gas_limit: vsize,
        })
    }

    async fn submit_sweep(
        &self,
        network: &Network,
        plan: &SweepPlan,
        signer: &dyn DigestSigner,
    ) -> Result<String, ChainError> {
        let btc_network = bitcoin_network(network)?;
        let to = Address::<NetworkUnchecked>::from_str(&plan.to)
            .map_err(|e| ChainError::InvalidAddress(e.to_string()))?
            .require_network(btc_network)
            .map_err(|e| ChainError::InvalidAddress(e.to_string()))?;

        if plan.amount < DUST_LIMIT_SATS {
            return Err(ChainError::Build(format!(
                "sweep amount {} below dust limit",
                plan.amount
            )));
        }

        let utxos = self.get_utxos(&plan.from).await?;
        let total: u128 = utxos.iter().map(|u| u.value as u128).sum();
        if total != plan.amount + plan.fee.total {
            return Err(ChainError::Build(format!(
                "UTXO set changed: have {}, plan spends {}",
                total,
                plan.amount + plan.fee.total
            )));
        }

        let tx = build_sweep_tx(&utxos, &to, plan.amount, signer)?;
        let tx_hex = bitcoin::consensus::encode::serialize_hex(&tx);

        tracing::debug!(
            target: "custody::sweep",
            from = %plan.from,
            inputs = utxos.len(),
            "Broadcasting bitcoin sweep"
        );

        self.broadcast_tx(&tx_hex).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HandleSigner;
    use crate::keystore::{EncryptedKeyStore, KeyStore};
    use crate::types::BitcoinNetwork;
    use std::sync::Arc;

    #[test]
    fn test_client_urls() {
        let mainnet = EsploraClient::new_mainnet();
        assert_eq!(mainnet.base_url(), MAINNET_URL);

        let custom = EsploraClient::new("http://localhost:3000/", Duration::from_secs(1));
        assert_eq!(custom.base_url(), "http://localhost:3000");
    }

    #[test]
    fn test_vsize_grows_per_input() {
        assert_eq!(sweep_vsize(1), 122);
        assert_eq!(sweep_vsize(2) - sweep_vsize(1), 68);
    }

    #[test]
    fn test_build_signed_sweep() {
        let store: Arc<dyn KeyStore> = Arc::new(EncryptedKeyStore::ephemeral("pass"));
        let family = AddressFamily::Bitcoin {
            network: BitcoinNetwork::Testnet,
        };
        let key = store.generate(&family).unwrap();
        let signer = HandleSigner::new(store, key.handle);

        let to = Address::<NetworkUnchecked>::from_str("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
            .unwrap()
            .require_network(bitcoin::Network::Testnet)
            .unwrap();

        let utxos = vec![
            EsploraUtxo {
                txid: "a".repeat(64),
                vout: 0,
                value: 60_000,
                status: EsploraTxStatus {
                    confirmed: true,
                    block_height: Some(100),
                },
            },
            EsploraUtxo {
                txid: "b".repeat(64),
                vout: 1,
                value: 40_000,
                status: EsploraTxStatus {
                    confirmed: true,
                    block_height: Some(101),
                },
            },
        ];

        let tx = build_sweep_tx(&utxos, &to, 99_000, &signer).unwrap();
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, Amount::from_sat(99_000));
        // witness = [signature, pubkey]
        assert!(tx.input.iter().all(|i| i.witness.len() == 2));
    }
}
