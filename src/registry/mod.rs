//! Registries
//!
//! - [`network::NetworkRegistry`]: static catalog of supported networks
//! - [`master_wallet::MasterWalletRegistry`]: per-network sweep destinations

pub mod master_wallet;
pub mod network;

pub use master_wallet::MasterWalletRegistry;
pub use network::NetworkRegistry;
