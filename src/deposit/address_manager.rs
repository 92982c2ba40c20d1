//! Deposit Address Manager
//!
//! Issues one custodial address per (user, asset, network). The store's
//! uniqueness constraint decides races: the loser of a concurrent first
//! request discards its freshly generated key and returns the winner's record.

use std::sync::Arc;

use super::locks::AddressLocks;
use crate::common::error::{CustodyError, Result};
use crate::keystore::KeyStore;
use crate::registry::NetworkRegistry;
use crate::storage::{AddressStore, CustodyStore, DepositTxStore, StorageError};
use crate::types::DepositAddress;

/// Result of `get_or_create_address`
#[derive(Debug, Clone)]
pub struct ProvisionedAddress {
    pub address: DepositAddress,
    /// False when an existing record was returned
    pub created: bool,
}

pub struct DepositAddressManager {
    store: Arc<dyn CustodyStore>,
    networks: Arc<NetworkRegistry>,
    keystore: Arc<dyn KeyStore>,
    locks: Arc<AddressLocks>,
}

impl DepositAddressManager {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        networks: Arc<NetworkRegistry>,
        keystore: Arc<dyn KeyStore>,
        locks: Arc<AddressLocks>,
    ) -> Self {
        Self {
            store,
            networks,
            keystore,
            locks,
        }
    }

    /// Return the user's address for (asset, network), creating it on first use
    pub async fn get_or_create_address(
        &self,
        user_id: &str,
        asset_id: &str,
        network_id: &str,
    ) -> Result<ProvisionedAddress> {
        if user_id.trim().is_empty() {
            return Err(CustodyError::validation("user id is required"));
        }
        let network = match self.networks.resolve(asset_id, network_id) {
            Ok(n) => n,
            Err(CustodyError::NotFound(msg)) => {
                return Err(CustodyError::validation(format!("unsupported {}", msg)))
            }
            Err(e) => return Err(e),
        };
        if !network.active {
            return Err(CustodyError::validation(format!(
                "network {} is not accepting deposits",
                network_id
            )));
        }

        if let Some(existing) = self.store.find_address(user_id, asset_id, network_id).await? {
            return Self::existing(existing);
        }

        let key = self.keystore.generate(&network.family)?;
        let record = DepositAddress::new(user_id, asset_id, network_id, &key.address, &key.handle);

        match self.store.insert_address(&record).await {
            Ok(()) => {
                tracing::info!(
                    target: "custody::deposit",
                    address_id = %record.id,
                    user_id = %user_id,
                    asset_id = %asset_id,
                    network_id = %network_id,
                    address = %record.address,
                    "Deposit address created"
                );
                Ok(ProvisionedAddress {
                    address: record,
                    created: true,
                })
            }
            Err(StorageError::Duplicate(_)) => {
                if let Err(e) = self.keystore.discard(&key.handle) {
                    tracing::warn!(
                        target: "custody::deposit",
                        error = %e,
                        "Failed to discard key of losing provisioning race"
                    );
                }
                let winner = self
                    .store
                    .find_address(user_id, asset_id, network_id)
                    .await?
                    .ok_or_else(|| {
                        CustodyError::internal("address vanished after uniqueness conflict")
                    })?;
                Self::existing(winner)
            }
            Err(e) => {
                let _ = self.keystore.discard(&key.handle);
                Err(e.into())
            }
        }
    }

    fn existing(record: DepositAddress) -> Result<ProvisionedAddress> {
        if !record.is_active {
            return Err(CustodyError::conflict(format!(
                "deposit address {} is deactivated and must be reactivated by an operator",
                record.id
            )));
        }
        Ok(ProvisionedAddress {
            address: record,
            created: false,
        })
    }

    /// Toggle polling eligibility; the watcher picks it up on its next pass
    pub async fn set_active(&self, address_id: &str, active: bool) -> Result<DepositAddress> {
        self.store.set_address_active(address_id, active).await?;
        tracing::info!(
            target: "custody::deposit",
            address_id = %address_id,
            active,
            "Deposit address activation changed"
        );
        self.get(address_id).await
    }

    /// Delete an address with nothing left to account for
    ///
    /// The signing key stays in the Key Store.
    pub async fn delete_address(&self, address_id: &str) -> Result<()> {
        self.get(address_id).await?;

        // Holding the sweep lock keeps sweeps out while we check and delete
        let guard = self
            .locks
            .begin_sweep(address_id)
            .ok_or_else(|| CustodyError::conflict("sweep in progress"))?;
        let gate = guard.exclusive().await;

        // Re-read under the gate: an evaluation that just finished may have
        // completed a deposit
        let record = self.get(address_id).await?;
        if record.last_balance != 0 {
            return Err(CustodyError::conflict(format!(
                "address {} still holds {}",
                address_id, record.last_balance
            )));
        }
        if !self.store.open_deposits(address_id).await?.is_empty() {
            return Err(CustodyError::conflict(format!(
                "address {} has deposits in flight",
                address_id
            )));
        }
        if !self.store.delete_address(address_id).await? {
            return Err(CustodyError::not_found(format!("deposit address {}", address_id)));
        }

        drop(gate);
        drop(guard);
        self.locks.forget(address_id);

        tracing::info!(
            target: "custody::deposit",
            address_id = %address_id,
            "Deposit address deleted"
        );
        Ok(())
    }

    pub async fn get(&self, address_id: &str) -> Result<DepositAddress> {
        self.store
            .get_address(address_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("deposit address {}", address_id)))
    }

    pub async fn list(&self) -> Result<Vec<DepositAddress>> {
        Ok(self.store.list_addresses().await?)
    }
}
