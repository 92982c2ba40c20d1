//! Custody Backend - Deposit & Sweep Services
//!
//! Custodial deposit handling for multiple chains:
//!
//! 1. **Deposit Address Manager** - One custodial address per (user, asset, network)
//! 2. **Deposit Watcher** - Polls chains, confirms deposits, credits the ledger exactly once
//! 3. **Sweep Orchestrator** - Moves funds from deposit addresses into master wallets
//!
//! ## Boundaries
//!
//! - Private keys live only in the [`keystore`]; everything else holds opaque handles
//! - User balances live in the external ledger; this service only issues credits
//! - Chains are reached through [`chain::ChainClient`] (Esplora, EVM JSON-RPC, simulated)

pub mod api;
pub mod chain;
pub mod collaborators;
pub mod common;
pub mod deposit;
pub mod keystore;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod sweep;
pub mod types;

// Re-exports: configuration and errors
pub use common::{CustodyConfig, CustodyError, Deployment, Result};

// Re-exports: chain access
pub use chain::{ChainClient, ChainClients, ChainError, EsploraClient, EvmRpcClient, SimulatedChain};

// Re-exports: services
pub use deposit::{DepositAddressManager, DepositWatcher, PollReport, WatcherSupervisor};
pub use registry::{MasterWalletRegistry, NetworkRegistry};
pub use runtime::{Backends, CustodyServices};
pub use sweep::SweepOrchestrator;

// Re-exports: data model
pub use types::{
    DepositAddress, DepositTransaction, DepositTxStatus, MasterWallet, Network, SweepResult,
    SweepStatus,
};
