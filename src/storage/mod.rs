//! Storage Layer Module
//!
//! Persistence for deposit addresses, deposit transactions, master wallets
//! and the sweep audit log.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for tests and the demo

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryCustodyStore;
pub use sqlite::SqliteCustodyStore;
pub use traits::{
    AddressStore, CustodyStore, DepositTxStore, MasterWalletStore, StorageError, StorageResult,
    SweepAuditStore,
};
