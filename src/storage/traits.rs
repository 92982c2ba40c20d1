//! Storage Trait Definitions
//!
//! Abstract storage interfaces for deposit addresses, deposit transactions,
//! master wallets and the sweep audit log. Uniqueness rules live here and are
//! enforced by every implementation:
//!
//! - one deposit address per (user, asset, network)
//! - one deposit transaction per (address, idempotency key)
//! - at most one active master wallet per network
//! - completed/failed deposit transactions are never rewritten

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DepositAddress, DepositTransaction, MasterWallet, SweepAuditRecord};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Deposit address storage
#[async_trait]
pub trait AddressStore: Send + Sync {
    /// Insert a new address; `Duplicate` when the (user, asset, network) tuple exists
    async fn insert_address(&self, record: &DepositAddress) -> StorageResult<()>;

    async fn get_address(&self, id: &str) -> StorageResult<Option<DepositAddress>>;

    /// Look up the address for a (user, asset, network) tuple
    async fn find_address(
        &self,
        owner_user_id: &str,
        asset_id: &str,
        network_id: &str,
    ) -> StorageResult<Option<DepositAddress>>;

    async fn list_addresses(&self) -> StorageResult<Vec<DepositAddress>>;

    /// Active addresses of one network, in creation order
    async fn list_active_addresses(&self, network_id: &str) -> StorageResult<Vec<DepositAddress>>;

    async fn set_address_active(&self, id: &str, active: bool) -> StorageResult<()>;

    /// Reset `last_balance` to an observed balance and bump the baseline epoch
    async fn rebaseline(&self, id: &str, balance: u128) -> StorageResult<DepositAddress>;

    async fn delete_address(&self, id: &str) -> StorageResult<bool>;
}

/// Deposit transaction storage
#[async_trait]
pub trait DepositTxStore: Send + Sync {
    /// Insert a new deposit; `Duplicate` when (address, idempotency key) exists
    async fn insert_deposit(&self, record: &DepositTransaction) -> StorageResult<()>;

    /// Update a non-terminal deposit
    async fn update_deposit(&self, record: &DepositTransaction) -> StorageResult<()>;

    async fn get_deposit(&self, id: &str) -> StorageResult<Option<DepositTransaction>>;

    async fn find_deposit_by_key(
        &self,
        address_id: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<DepositTransaction>>;

    /// Non-terminal deposits of one address, oldest first
    async fn open_deposits(&self, address_id: &str) -> StorageResult<Vec<DepositTransaction>>;

    /// All deposits of one address, oldest first
    async fn deposits_for_address(&self, address_id: &str) -> StorageResult<Vec<DepositTransaction>>;

    /// All deposits, newest first
    async fn list_deposits(&self) -> StorageResult<Vec<DepositTransaction>>;

    /// Persist a completed deposit and advance its address in one transaction
    ///
    /// Sets the address's `last_balance` to `new_last_balance` and stamps
    /// `last_used_at`. Fails with `InvalidData` when the stored deposit is
    /// already terminal.
    async fn complete_deposit(
        &self,
        record: &DepositTransaction,
        new_last_balance: u128,
        used_at: u64,
    ) -> StorageResult<()>;
}

/// Master wallet storage
#[async_trait]
pub trait MasterWalletStore: Send + Sync {
    /// Insert a wallet; `Duplicate` when it would be a second active wallet
    async fn insert_master_wallet(&self, record: &MasterWallet) -> StorageResult<()>;

    async fn get_master_wallet(&self, id: &str) -> StorageResult<Option<MasterWallet>>;

    async fn active_master_wallet(&self, network_id: &str) -> StorageResult<Option<MasterWallet>>;

    async fn list_master_wallets(&self) -> StorageResult<Vec<MasterWallet>>;

    /// Toggle a wallet; `Duplicate` when activating a second active wallet
    async fn set_master_wallet_active(&self, id: &str, active: bool) -> StorageResult<()>;
}

/// Append-only sweep audit log
#[async_trait]
pub trait SweepAuditStore: Send + Sync {
    async fn record_sweep(&self, record: &SweepAuditRecord) -> StorageResult<()>;

    /// Most recent records first
    async fn list_sweeps(&self, limit: usize) -> StorageResult<Vec<SweepAuditRecord>>;
}

/// Everything the custody services persist
///
/// Implementations:
/// - `SqliteCustodyStore` - Production storage with SQLite
/// - `MemoryCustodyStore` - In-memory storage for tests and the demo
pub trait CustodyStore: AddressStore + DepositTxStore + MasterWalletStore + SweepAuditStore {}

impl<T> CustodyStore for T where T: AddressStore + DepositTxStore + MasterWalletStore + SweepAuditStore {}
