//! Master (treasury) wallet records

use serde::{Deserialize, Serialize};

use crate::common::now_secs;

/// Sweep destination for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterWallet {
    pub id: String,
    pub network_id: String,
    pub label: String,
    pub symbol: String,
    pub address: String,
    pub is_active: bool,
    pub created_at: u64,
}

impl MasterWallet {
    pub fn new(
        network_id: impl Into<String>,
        label: impl Into<String>,
        symbol: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("mw_{}", uuid::Uuid::new_v4().simple()),
            network_id: network_id.into(),
            label: label.into(),
            symbol: symbol.into(),
            address: address.into(),
            is_active: true,
            created_at: now_secs(),
        }
    }
}
