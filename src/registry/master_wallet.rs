//! Master Wallet Registry
//!
//! Operator-provisioned sweep destinations, at most one active per network.
//! The store's uniqueness rule backs the one-active invariant, so two racing
//! `create` calls cannot both succeed.

use std::sync::Arc;

use super::network::NetworkRegistry;
use crate::common::error::{CustodyError, Result};
use crate::keystore::address::validate_address;
use crate::storage::{CustodyStore, MasterWalletStore, StorageError};
use crate::types::MasterWallet;

pub struct MasterWalletRegistry {
    store: Arc<dyn CustodyStore>,
    networks: Arc<NetworkRegistry>,
}

impl MasterWalletRegistry {
    pub fn new(store: Arc<dyn CustodyStore>, networks: Arc<NetworkRegistry>) -> Self {
        Self { store, networks }
    }

    /// Register the active master wallet of a network
    pub async fn create(
        &self,
        network_id: &str,
        label: &str,
        symbol: &str,
        address: &str,
    ) -> Result<MasterWallet> {
        let network = self
            .networks
            .chain(network_id)
            .ok_or_else(|| CustodyError::validation(format!("unknown network: {}", network_id)))?;

        let (label, symbol, address) = (label.trim(), symbol.trim(), address.trim());
        if label.is_empty() || symbol.is_empty() {
            return Err(CustodyError::validation("label and symbol are required"));
        }
        if !validate_address(&network.family, address) {
            return Err(CustodyError::validation(format!(
                "malformed {} address: {}",
                network.family.name(),
                address
            )));
        }

        if let Some(existing) = self.store.active_master_wallet(network_id).await? {
            return Err(CustodyError::conflict(format!(
                "network {} already has active master wallet {}",
                network_id, existing.id
            )));
        }

        let wallet = MasterWallet::new(network_id, label, symbol, address);
        match self.store.insert_master_wallet(&wallet).await {
            Ok(()) => {}
            Err(StorageError::Duplicate(_)) => {
                return Err(CustodyError::conflict(format!(
                    "network {} already has an active master wallet",
                    network_id
                )))
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            target: "custody::sweep",
            wallet_id = %wallet.id,
            network_id = %network_id,
            address = %wallet.address,
            "Master wallet registered"
        );
        Ok(wallet)
    }

    pub async fn active_for_network(&self, network_id: &str) -> Result<Option<MasterWallet>> {
        Ok(self.store.active_master_wallet(network_id).await?)
    }

    /// Activate or retire a wallet; activating a second one is a Conflict
    pub async fn set_active(&self, wallet_id: &str, active: bool) -> Result<MasterWallet> {
        self.store.set_master_wallet_active(wallet_id, active).await?;
        self.store
            .get_master_wallet(wallet_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("master wallet {}", wallet_id)))
    }

    pub async fn list(&self) -> Result<Vec<MasterWallet>> {
        Ok(self.store.list_master_wallets().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::Deployment;
    use crate::storage::MemoryCustodyStore;

    const ETH_ADDR: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";

    fn registry() -> MasterWalletRegistry {
        MasterWalletRegistry::new(
            Arc::new(MemoryCustodyStore::new()),
            Arc::new(NetworkRegistry::builtin(Deployment::Devnet)),
        )
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let wallets = registry();
        let wallet = wallets
            .create("eth-devnet", "Treasury", "ETH", ETH_ADDR)
            .await
            .unwrap();

        let active = wallets.active_for_network("eth-devnet").await.unwrap().unwrap();
        assert_eq!(active.id, wallet.id);
        assert!(wallets.active_for_network("btc-regtest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation() {
        let wallets = registry();
        assert!(matches!(
            wallets.create("nope", "T", "ETH", ETH_ADDR).await,
            Err(CustodyError::Validation(_))
        ));
        assert!(matches!(
            wallets.create("eth-devnet", " ", "ETH", ETH_ADDR).await,
            Err(CustodyError::Validation(_))
        ));
        assert!(matches!(
            wallets.create("eth-devnet", "T", "ETH", "bcrt1qnotevm").await,
            Err(CustodyError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_second_active_wallet_conflicts() {
        let wallets = registry();
        let first = wallets.create("eth-devnet", "A", "ETH", ETH_ADDR).await.unwrap();
        assert!(matches!(
            wallets.create("eth-devnet", "B", "ETH", ETH_ADDR).await,
            Err(CustodyError::Conflict(_))
        ));

        // Retiring the first frees the slot
        wallets.set_active(&first.id, false).await.unwrap();
        wallets.create("eth-devnet", "B", "ETH", ETH_ADDR).await.unwrap();
        assert!(wallets.set_active(&first.id, true).await.is_err());
        assert_eq!(wallets.list().await.unwrap().len(), 2);
    }
}
