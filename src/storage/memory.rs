//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for tests, the demo and development.
//! Data is lost when the service restarts. All tables sit behind one lock so
//! multi-record operations (completing a deposit) are atomic.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{
    AddressStore, DepositTxStore, MasterWalletStore, StorageError, StorageResult, SweepAuditStore,
};
use crate::types::{DepositAddress, DepositTransaction, MasterWallet, SweepAuditRecord};

#[derive(Default)]
struct Tables {
    addresses: HashMap<String, DepositAddress>,
    /// Index: (user, asset, network) -> address ID
    by_tuple: HashMap<(String, String, String), String>,
    deposits: HashMap<String, DepositTransaction>,
    /// Index: (address ID, idempotency key) -> deposit ID
    by_key: HashMap<(String, String), String>,
    wallets: HashMap<String, MasterWallet>,
    sweeps: Vec<SweepAuditRecord>,
}

/// In-memory custody store
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryCustodyStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryCustodyStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn tuple_of(record: &DepositAddress) -> (String, String, String) {
    (
        record.owner_user_id.clone(),
        record.asset_id.clone(),
        record.network_id.clone(),
    )
}

#[async_trait]
impl AddressStore for MemoryCustodyStore {
    async fn insert_address(&self, record: &DepositAddress) -> StorageResult<()> {
        let mut t = self.tables.write().await;

        if t.addresses.contains_key(&record.id) {
            return Err(StorageError::Duplicate(format!("ID: {}", record.id)));
        }
        let tuple = tuple_of(record);
        if t.by_tuple.contains_key(&tuple) {
            return Err(StorageError::Duplicate(format!(
                "address for {}/{}/{}",
                tuple.0, tuple.1, tuple.2
            )));
        }

        t.by_tuple.insert(tuple, record.id.clone());
        t.addresses.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_address(&self, id: &str) -> StorageResult<Option<DepositAddress>> {
        Ok(self.tables.read().await.addresses.get(id).cloned())
    }

    async fn find_address(
        &self,
        owner_user_id: &str,
        asset_id: &str,
        network_id: &str,
    ) -> StorageResult<Option<DepositAddress>> {
        let t = self.tables.read().await;
        let key = (
            owner_user_id.to_string(),
            asset_id.to_string(),
            network_id.to_string(),
        );
        Ok(t.by_tuple.get(&key).and_then(|id| t.addresses.get(id)).cloned())
    }

    async fn list_addresses(&self) -> StorageResult<Vec<DepositAddress>> {
        let t = self.tables.read().await;
        let mut all: Vec<_> = t.addresses.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn list_active_addresses(&self, network_id: &str) -> StorageResult<Vec<DepositAddress>> {
        Ok(self
            .list_addresses()
            .await?
            .into_iter()
            .filter(|a| a.is_active && a.network_id == network_id)
            .collect())
    }

    async fn set_address_active(&self, id: &str, active: bool) -> StorageResult<()> {
        let mut t = self.tables.write().await;
        let record = t
            .addresses
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        record.is_active = active;
        Ok(())
    }

    async fn rebaseline(&self, id: &str, balance: u128) -> StorageResult<DepositAddress> {
        let mut t = self.tables.write().await;
        let record = t
            .addresses
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        record.last_balance = balance;
        record.baseline_epoch += 1;
        Ok(record.clone())
    }

    async fn delete_address(&self, id: &str) -> StorageResult<bool> {
        let mut t = self.tables.write().await;
        match t.addresses.remove(id) {
            Some(record) => {
                t.by_tuple.remove(&tuple_of(&record));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DepositTxStore for MemoryCustodyStore {
    async fn insert_deposit(&self, record: &DepositTransaction) -> StorageResult<()> {
        let mut t = self.tables.write().await;
        let key = (record.address_id.clone(), record.idempotency_key.clone());
        if t.by_key.contains_key(&key) || t.deposits.contains_key(&record.id) {
            return Err(StorageError::Duplicate(record.idempotency_key.clone()));
        }
        t.by_key.insert(key, record.id.clone());
        t.deposits.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_deposit(&self, record: &DepositTransaction) -> StorageResult<()> {
        let mut t = self.tables.write().await;
        let stored = t
            .deposits
            .get_mut(&record.id)
            .ok_or_else(|| StorageError::NotFound(record.id.clone()))?;
        if stored.status.is_terminal() {
            return Err(StorageError::InvalidData(format!(
                "deposit {} is {}",
                record.id, stored.status
            )));
        }
        *stored = record.clone();
        Ok(())
    }

    async fn get_deposit(&self, id: &str) -> StorageResult<Option<DepositTransaction>> {
        Ok(self.tables.read().await.deposits.get(id).cloned())
    }

    async fn find_deposit_by_key(
        &self,
        address_id: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<DepositTransaction>> {
        let t = self.tables.read().await;
        let key = (address_id.to_string(), idempotency_key.to_string());
        Ok(t.by_key.get(&key).and_then(|id| t.deposits.get(id)).cloned())
    }

    async fn open_deposits(&self, address_id: &str) -> StorageResult<Vec<DepositTransaction>> {
        Ok(self
            .deposits_for_address(address_id)
            .await?
            .into_iter()
            .filter(|d| d.is_open())
            .collect())
    }

    async fn deposits_for_address(&self, address_id: &str) -> StorageResult<Vec<DepositTransaction>> {
        let t = self.tables.read().await;
        let mut list: Vec<_> = t
            .deposits
            .values()
            .filter(|d| d.address_id == address_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn list_deposits(&self) -> StorageResult<Vec<DepositTransaction>> {
        let t = self.tables.read().await;
        let mut list: Vec<_> = t.deposits.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(list)
    }

    async fn complete_deposit(
        &self,
        record: &DepositTransaction,
        new_last_balance: u128,
        used_at: u64,
    ) -> StorageResult<()> {
        let mut t = self.tables.write().await;

        match t.deposits.get(&record.id) {
            None => return Err(StorageError::NotFound(record.id.clone())),
            Some(stored) if stored.status.is_terminal() => {
                return Err(StorageError::InvalidData(format!(
                    "deposit {} is {}",
                    record.id, stored.status
                )))
            }
            Some(_) => {}
        }
        if !t.addresses.contains_key(&record.address_id) {
            return Err(StorageError::NotFound(record.address_id.clone()));
        }

        t.deposits.insert(record.id.clone(), record.clone());
        if let Some(address) = t.addresses.get_mut(&record.address_id) {
            address.last_balance = new_last_balance;
            address.last_used_at = Some(used_at);
        }
        Ok(())
    }
}

#[async_trait]
impl MasterWalletStore for MemoryCustodyStore {
    async fn insert_master_wallet(&self, record: &MasterWallet) -> StorageResult<()> {
        let mut t = self.tables.write().await;
        if t.wallets.contains_key(&record.id) {
            return Err(StorageError::Duplicate(format!("ID: {}", record.id)));
        }
        if record.is_active
            && t
                .wallets
                .values()
                .any(|w| w.is_active && w.network_id == record.network_id)
        {
            return Err(StorageError::Duplicate(format!(
                "active master wallet for {}",
                record.network_id
            )));
        }
        t.wallets.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_master_wallet(&self, id: &str) -> StorageResult<Option<MasterWallet>> {
        Ok(self.tables.read().await.wallets.get(id).cloned())
    }

    async fn active_master_wallet(&self, network_id: &str) -> StorageResult<Option<MasterWallet>> {
        let t = self.tables.read().await;
        Ok(t
            .wallets
            .values()
            .find(|w| w.is_active && w.network_id == network_id)
            .cloned())
    }

    async fn list_master_wallets(&self) -> StorageResult<Vec<MasterWallet>> {
        let t = self.tables.read().await;
        let mut list: Vec<_> = t.wallets.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn set_master_wallet_active(&self, id: &str, active: bool) -> StorageResult<()> {
        let mut t = self.tables.write().await;
        let network_id = t
            .wallets
            .get(id)
            .map(|w| w.network_id.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if active
            && t
                .wallets
                .values()
                .any(|w| w.is_active && w.network_id == network_id && w.id != id)
        {
            return Err(StorageError::Duplicate(format!(
                "active master wallet for {}",
                network_id
            )));
        }
        if let Some(wallet) = t.wallets.get_mut(id) {
            wallet.is_active = active;
        }
        Ok(())
    }
}

#[async_trait]
impl SweepAuditStore for MemoryCustodyStore {
    async fn record_sweep(&self, record: &SweepAuditRecord) -> StorageResult<()> {
        self.tables.write().await.sweeps.push(record.clone());
        Ok(())
    }

    async fn list_sweeps(&self, limit: usize) -> StorageResult<Vec<SweepAuditRecord>> {
        let t = self.tables.read().await;
        Ok(t.sweeps.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DepositTxStatus;

    #[tokio::test]
    async fn test_address_tuple_unique() {
        let store = MemoryCustodyStore::new();
        let a = DepositAddress::new("u1", "eth", "eth-mainnet", "0x1", "kh_1");
        let b = DepositAddress::new("u1", "eth", "eth-mainnet", "0x2", "kh_2");

        store.insert_address(&a).await.unwrap();
        let result = store.insert_address(&b).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));

        let found = store.find_address("u1", "eth", "eth-mainnet").await.unwrap().unwrap();
        assert_eq!(found.id, a.id);
    }

    #[tokio::test]
    async fn test_rebaseline_bumps_epoch() {
        let store = MemoryCustodyStore::new();
        let a = DepositAddress::new("u1", "eth", "eth-mainnet", "0x1", "kh_1");
        store.insert_address(&a).await.unwrap();

        let updated = store.rebaseline(&a.id, 7).await.unwrap();
        assert_eq!(updated.last_balance, 7);
        assert_eq!(updated.baseline_epoch, 1);
    }

    #[tokio::test]
    async fn test_complete_deposit_is_once() {
        let store = MemoryCustodyStore::new();
        let a = DepositAddress::new("u1", "eth", "eth-mainnet", "0x1", "kh_1");
        store.insert_address(&a).await.unwrap();

        let mut tx = DepositTransaction::new(&a.id, 5, 1, "key-1");
        store.insert_deposit(&tx).await.unwrap();
        assert!(matches!(
            store.insert_deposit(&DepositTransaction::new(&a.id, 5, 1, "key-1")).await,
            Err(StorageError::Duplicate(_))
        ));

        tx.update_confirmations(1);
        tx.mark_completed().unwrap();
        store.complete_deposit(&tx, 5, 100).await.unwrap();

        let address = store.get_address(&a.id).await.unwrap().unwrap();
        assert_eq!(address.last_balance, 5);
        assert_eq!(address.last_used_at, Some(100));
        assert_eq!(
            store.get_deposit(&tx.id).await.unwrap().unwrap().status,
            DepositTxStatus::Completed
        );

        assert!(matches!(
            store.complete_deposit(&tx, 10, 200).await,
            Err(StorageError::InvalidData(_))
        ));
        assert!(store.open_deposits(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_active_master_wallet() {
        let store = MemoryCustodyStore::new();
        let first = MasterWallet::new("eth-mainnet", "Treasury", "ETH", "0xa");
        let second = MasterWallet::new("eth-mainnet", "Treasury 2", "ETH", "0xb");

        store.insert_master_wallet(&first).await.unwrap();
        assert!(store.insert_master_wallet(&second).await.is_err());

        store.set_master_wallet_active(&first.id, false).await.unwrap();
        store.insert_master_wallet(&second).await.unwrap();
        assert!(store.set_master_wallet_active(&first.id, true).await.is_err());

        let active = store.active_master_wallet("eth-mainnet").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }
}
