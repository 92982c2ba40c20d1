//! Deposit Subsystem
//!
//! - [`address_manager`]: one custodial address per (user, asset, network)
//! - [`watcher`]: per-address deposit state machine and ledger crediting
//! - [`scheduler`]: supervised per-network polling loops
//! - [`locks`]: sweep lock and evaluation gate shared with the sweep orchestrator

pub mod address_manager;
pub mod locks;
pub mod scheduler;
pub mod watcher;

pub use address_manager::{DepositAddressManager, ProvisionedAddress};
pub use locks::{AddressLocks, EvaluationGuard, SweepGuard};
pub use scheduler::{backoff_delay, SchedulerConfig, WatcherSupervisor};
pub use watcher::{DepositWatcher, PollReport};
