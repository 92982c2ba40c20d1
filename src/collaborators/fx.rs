//! FX rate feed collaborator
//!
//! Rates are informational: they fill `usd_value` on deposit records and
//! never gate crediting.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FxError {
    #[error("no rate for asset {0}")]
    UnknownAsset(String),

    #[error("rate feed unavailable: {0}")]
    Unavailable(String),
}

/// USD price per whole unit of an asset
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FxRateFeed: Send + Sync {
    async fn usd_rate(&self, asset_id: &str) -> Result<f64, FxError>;
}

/// Static rate table
#[derive(Debug, Clone, Default)]
pub struct FixedRateFeed {
    rates: HashMap<String, f64>,
}

impl FixedRateFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, asset_id: &str, usd: f64) -> Self {
        self.rates.insert(asset_id.to_string(), usd);
        self
    }

    /// Rough placeholder prices for devnet
    pub fn devnet() -> Self {
        Self::new()
            .with_rate("btc", 60_000.0)
            .with_rate("eth", 3_000.0)
            .with_rate("usdc", 1.0)
            .with_rate("usdt", 1.0)
    }
}

#[async_trait]
impl FxRateFeed for FixedRateFeed {
    async fn usd_rate(&self, asset_id: &str) -> Result<f64, FxError> {
        self.rates
            .get(asset_id)
            .copied()
            .ok_or_else(|| FxError::UnknownAsset(asset_id.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    usd: f64,
}

/// Rate feed over HTTP: `GET {base}/rates/{asset}` -> `{"usd": 1.0}`
#[derive(Debug, Clone)]
pub struct HttpRateFeed {
    client: Client,
    base_url: String,
}

impl HttpRateFeed {
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
impl FxRateFeed for HttpRateFeed {
    async fn usd_rate(&self, asset_id: &str) -> Result<f64, FxError> {
        let url = format!("{}/rates/{}", self.base_url, asset_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FxError::Unavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FxError::UnknownAsset(asset_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FxError::Unavailable(resp.status().to_string()));
        }

        let rate: RateResponse = resp
            .json()
            .await
            .map_err(|e| FxError::Unavailable(e.to_string()))?;
        Ok(rate.usd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_feed() {
        let feed = FixedRateFeed::new().with_rate("btc", 50_000.0);
        assert_eq!(feed.usd_rate("btc").await.unwrap(), 50_000.0);
        assert!(matches!(
            feed.usd_rate("doge").await,
            Err(FxError::UnknownAsset(_))
        ));
    }

    #[test]
    fn test_devnet_rates_cover_builtin_assets() {
        let feed = FixedRateFeed::devnet();
        for asset in ["btc", "eth", "usdc"] {
            assert!(feed.rates.contains_key(asset));
        }
    }
}
