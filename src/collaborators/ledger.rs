//! Ledger collaborator
//!
//! The ledger owns balance accounting. This service only ever asks it to
//! credit a user by an amount under an idempotency key, and relies on the
//! ledger to drop repeats of the same key.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Worth retrying on the next poll
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger rejected credit: {0}")]
    Rejected(String),
}

/// One credit instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub user_id: String,
    pub asset_id: String,
    /// Base units; serialized as a decimal string
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub idempotency_key: String,
}

/// Outcome of a credit call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied,
    /// The key was already applied earlier
    Duplicate,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, LedgerError>;
}

mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ledger reached over HTTP
///
/// `POST {base}/credits` with the request as JSON and the key repeated in an
/// `Idempotency-Key` header. 409 means the key was seen before.
#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, LedgerError> {
        let url = format!("{}/credits", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(CreditOutcome::Applied);
        }
        if status == StatusCode::CONFLICT {
            return Ok(CreditOutcome::Duplicate);
        }

        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(LedgerError::Unavailable(format!("{}: {}", status, body)))
        } else {
            Err(LedgerError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

/// Ledger kept in memory, used for devnet and tests
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    applied: Mutex<HashMap<String, CreditRequest>>,
    order: Mutex<Vec<String>>,
    unavailable: Mutex<bool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied credits in arrival order
    pub fn credits(&self) -> Vec<CreditRequest> {
        let applied = self.applied.lock();
        self.order
            .lock()
            .iter()
            .filter_map(|k| applied.get(k).cloned())
            .collect()
    }

    /// Sum credited to a user for an asset
    pub fn balance(&self, user_id: &str, asset_id: &str) -> u128 {
        self.applied
            .lock()
            .values()
            .filter(|c| c.user_id == user_id && c.asset_id == asset_id)
            .map(|c| c.amount)
            .sum()
    }

    /// Make subsequent calls fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, LedgerError> {
        if *self.unavailable.lock() {
            return Err(LedgerError::Unavailable("in-memory ledger offline".to_string()));
        }
        if request.amount == 0 {
            return Err(LedgerError::Rejected("zero amount".to_string()));
        }

        let mut applied = self.applied.lock();
        if applied.contains_key(&request.idempotency_key) {
            return Ok(CreditOutcome::Duplicate);
        }
        applied.insert(request.idempotency_key.clone(), request.clone());
        self.order.lock().push(request.idempotency_key.clone());
        Ok(CreditOutcome::Applied)
    }
}
