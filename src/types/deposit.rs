//! Deposit Types
//!
//! A [`DepositAddress`] is a custodial address owned by one user for one
//! (asset, network) pair. Each inbound value event on it becomes a
//! [`DepositTransaction`] that moves through:
//!
//! pending → confirming → completed
//!                      ↘ failed
//!
//! `completed` and `failed` are terminal. Completion is only reachable once the
//! confirmation count meets the threshold copied from the network.

use serde::{Deserialize, Serialize};

use crate::common::now_secs;

/// Status of an inbound deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DepositTxStatus {
    /// Seen, no confirmations yet
    #[default]
    Pending,
    /// At least one confirmation, below threshold
    Confirming,
    /// Threshold reached and ledger credited
    Completed,
    /// Reverted by a reorg or balance drop before crediting
    Failed,
}

impl DepositTxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for DepositTxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirming => "confirming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DepositTxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirming" => Ok(Self::Confirming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// A custodial deposit address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAddress {
    pub id: String,
    pub owner_user_id: String,
    pub asset_id: String,
    pub network_id: String,
    /// Chain address (immutable)
    pub address: String,
    /// Opaque Key Store handle (immutable)
    #[serde(skip_serializing, default)]
    pub key_handle: String,
    pub is_active: bool,
    /// Balance already accounted for (credited or swept)
    pub last_balance: u128,
    /// Bumped on every re-baseline; part of the balance-delta idempotency key
    pub baseline_epoch: u64,
    pub created_at: u64,
    /// Last time a deposit was credited to this address
    pub last_used_at: Option<u64>,
}

impl DepositAddress {
    pub fn new(
        owner_user_id: impl Into<String>,
        asset_id: impl Into<String>,
        network_id: impl Into<String>,
        address: impl Into<String>,
        key_handle: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("addr_{}", uuid::Uuid::new_v4().simple()),
            owner_user_id: owner_user_id.into(),
            asset_id: asset_id.into(),
            network_id: network_id.into(),
            address: address.into(),
            key_handle: key_handle.into(),
            is_active: true,
            last_balance: 0,
            baseline_epoch: 0,
            created_at: now_secs(),
            last_used_at: None,
        }
    }
}

/// One inbound value event on a deposit address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositTransaction {
    pub id: String,
    pub address_id: String,
    /// Chain transaction hash (transfer-history networks only)
    pub tx_hash: Option<String>,
    pub amount: u128,
    /// USD valuation at detection time, informational
    pub usd_value: f64,
    pub confirmations: u32,
    pub required_confirmations: u32,
    pub status: DepositTxStatus,
    /// `last_balance` of the address when the deposit was detected
    pub baseline_balance: u128,
    /// On-chain balance snapshot that produced this deposit
    pub observed_balance: u128,
    /// Chain tip height when detected (or the tx block height)
    pub detected_height: u64,
    /// Stable key used for the ledger credit and for dedup
    pub idempotency_key: String,
    pub failure_reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DepositTransaction {
    pub fn new(
        address_id: impl Into<String>,
        amount: u128,
        required_confirmations: u32,
        idempotency_key: impl Into<String>,
    ) -> Self {
        let now = now_secs();
        Self {
            id: format!("dtx_{}", uuid::Uuid::new_v4().simple()),
            address_id: address_id.into(),
            tx_hash: None,
            amount,
            usd_value: 0.0,
            confirmations: 0,
            required_confirmations: required_confirmations.max(1),
            status: DepositTxStatus::Pending,
            baseline_balance: 0,
            observed_balance: 0,
            detected_height: 0,
            idempotency_key: idempotency_key.into(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether the threshold has been reached
    pub fn is_confirmed(&self) -> bool {
        self.confirmations >= self.required_confirmations
    }

    /// Record a new confirmation count
    ///
    /// Never completes the deposit; that needs the ledger credit first.
    /// Terminal records are left untouched.
    pub fn update_confirmations(&mut self, confirmations: u32) {
        if self.status.is_terminal() {
            return;
        }
        self.confirmations = confirmations;
        self.status = if confirmations == 0 {
            DepositTxStatus::Pending
        } else {
            DepositTxStatus::Confirming
        };
        self.touch();
    }

    /// Mark as completed; refused below the confirmation threshold
    pub fn mark_completed(&mut self) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!("deposit {} already {}", self.id, self.status));
        }
        if !self.is_confirmed() {
            return Err(format!(
                "deposit {} has {}/{} confirmations",
                self.id, self.confirmations, self.required_confirmations
            ));
        }
        self.status = DepositTxStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Mark as failed (reorg, balance drop)
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.failure_reason = Some(reason.into());
        self.status = DepositTxStatus::Failed;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

/// Idempotency key for a transfer-history deposit
pub fn transfer_key(network_id: &str, address_id: &str, tx_hash: &str) -> String {
    format!("deposit:{}:{}:tx:{}", network_id, address_id, tx_hash)
}

/// Key for the `attempt`-th detection of a transfer-history deposit
///
/// Attempt 0 is the plain [`transfer_key`]. A transaction that was reorganized
/// out and later re-included is detected again under `:r{attempt}`, leaving
/// the failed record untouched.
pub fn redetection_key(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        base.to_string()
    } else {
        format!("{}:r{}", base, attempt)
    }
}

/// Idempotency key for a balance-delta deposit
///
/// Includes the baseline epoch so that a later, unrelated delta with the same
/// pre/post balances after a re-baseline is still a distinct deposit.
pub fn delta_key(network_id: &str, address_id: &str, epoch: u64, pre: u128, post: u128) -> String {
    format!(
        "deposit:{}:{}:delta:{}:{}->{}",
        network_id, address_id, epoch, pre, post
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for s in ["pending", "confirming", "completed", "failed"] {
            let status: DepositTxStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("claimed".parse::<DepositTxStatus>().is_err());
    }

    #[test]
    fn test_confirmation_gating() {
        let mut tx = DepositTransaction::new("addr_1", 5, 3, "k");
        for c in 0..3 {
            tx.update_confirmations(c);
            assert!(tx.mark_completed().is_err());
            assert_ne!(tx.status, DepositTxStatus::Completed);
        }
        tx.update_confirmations(3);
        assert_eq!(tx.status, DepositTxStatus::Confirming);
        tx.mark_completed().unwrap();
        assert_eq!(tx.status, DepositTxStatus::Completed);
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut tx = DepositTransaction::new("addr_1", 5, 1, "k");
        tx.mark_failed("reorg");
        tx.update_confirmations(10);
        assert_eq!(tx.status, DepositTxStatus::Failed);
        assert_eq!(tx.confirmations, 0);
        assert!(tx.mark_completed().is_err());
    }

    #[test]
    fn test_threshold_at_least_one() {
        let tx = DepositTransaction::new("addr_1", 5, 0, "k");
        assert_eq!(tx.required_confirmations, 1);
    }

    #[test]
    fn test_keys() {
        assert_eq!(
            transfer_key("btc-mainnet", "addr_1", "ab"),
            "deposit:btc-mainnet:addr_1:tx:ab"
        );
        assert_eq!(
            delta_key("eth-mainnet", "addr_1", 2, 0, 5),
            "deposit:eth-mainnet:addr_1:delta:2:0->5"
        );
        assert_eq!(redetection_key("deposit:n:a:tx:ab", 0), "deposit:n:a:tx:ab");
        assert_eq!(redetection_key("deposit:n:a:tx:ab", 2), "deposit:n:a:tx:ab:r2");
    }

    #[test]
    fn test_key_handle_not_serialized() {
        let addr = DepositAddress::new("u1", "eth", "eth-mainnet", "0xabc", "kh_secret");
        let json = serde_json::to_string(&addr).unwrap();
        assert!(!json.contains("kh_secret"));
    }
}
