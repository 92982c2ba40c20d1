//! External collaborators consumed at the boundary
//!
//! - [`ledger::Ledger`]: credits user balances, deduplicating by idempotency key
//! - [`fx::FxRateFeed`]: USD price per whole unit of an asset

pub mod fx;
pub mod ledger;

pub use fx::{FixedRateFeed, FxError, FxRateFeed, HttpRateFeed};
pub use ledger::{CreditOutcome, CreditRequest, HttpLedger, InMemoryLedger, Ledger, LedgerError};
