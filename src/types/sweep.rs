//! Sweep result and audit types

use serde::{Deserialize, Serialize};

use crate::common::now_secs;

/// Outcome of sweeping one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Success,
    /// Not enough native currency to pay the sweep fee
    NeedGas,
    Error,
}

impl std::fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::NeedGas => "need_gas",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SweepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "need_gas" => Ok(Self::NeedGas),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown sweep status: {}", s)),
        }
    }
}

/// Per-address sweep result returned to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepResult {
    pub address_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub status: SweepStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Native currency (base units) the sweep needs, for `need_gas`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_gas: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

impl SweepResult {
    pub fn success(address_id: &str, address: &str, network_id: &str, tx_hash: String, amount: u128) -> Self {
        Self {
            address_id: address_id.to_string(),
            address: Some(address.to_string()),
            status: SweepStatus::Success,
            message: format!("swept {}", amount),
            tx_hash: Some(tx_hash),
            required_gas: None,
            network_id: Some(network_id.to_string()),
        }
    }

    pub fn need_gas(address_id: &str, address: &str, network_id: &str, required: u128) -> Self {
        Self {
            address_id: address_id.to_string(),
            address: Some(address.to_string()),
            status: SweepStatus::NeedGas,
            message: "insufficient native balance for sweep fee".to_string(),
            tx_hash: None,
            required_gas: Some(required),
            network_id: Some(network_id.to_string()),
        }
    }

    pub fn error(address_id: &str, message: impl Into<String>) -> Self {
        Self {
            address_id: address_id.to_string(),
            address: None,
            status: SweepStatus::Error,
            message: message.into(),
            tx_hash: None,
            required_gas: None,
            network_id: None,
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn with_network(mut self, network_id: &str) -> Self {
        self.network_id = Some(network_id.to_string());
        self
    }
}

/// Persisted copy of a sweep result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepAuditRecord {
    pub id: String,
    /// Correlation id of the batch the result belongs to
    pub batch_id: String,
    pub result: SweepResult,
    /// Amount sent to the master wallet, for successes
    pub amount: Option<u128>,
    pub created_at: u64,
}

impl SweepAuditRecord {
    pub fn new(batch_id: &str, result: SweepResult, amount: Option<u128>) -> Self {
        Self {
            id: format!("swp_{}", uuid::Uuid::new_v4().simple()),
            batch_id: batch_id.to_string(),
            result,
            amount,
            created_at: now_secs(),
        }
    }
}
