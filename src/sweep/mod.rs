//! Sweep subsystem: operator-triggered batch transfers into master wallets

pub mod orchestrator;

pub use orchestrator::{SweepOrchestrator, SweepTimeouts, MSG_IN_PROGRESS, MSG_NO_MASTER_WALLET};
