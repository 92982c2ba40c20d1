//! Shared Types Module
//!
//! Data model shared across the custody backend.

pub mod deposit;
pub mod master_wallet;
pub mod network;
pub mod sweep;
pub mod units;

// Re-exports for convenience
pub use deposit::{delta_key, redetection_key, transfer_key, DepositAddress, DepositTransaction, DepositTxStatus};
pub use master_wallet::MasterWallet;
pub use network::{AddressFamily, BitcoinNetwork, FeeSchedule, Network};
pub use sweep::{SweepAuditRecord, SweepResult, SweepStatus};
pub use units::{parse_units, to_decimal_string, to_display, to_whole_units, SATS_PER_BTC};
