//! Deposit transaction endpoints

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use super::operator;
use crate::api::middleware::ApiError;
use crate::api::server::SharedAppState;
use crate::storage::DepositTxStore;
use crate::types::{DepositTransaction, DepositTxStatus};

#[derive(Debug, Default, Deserialize)]
pub struct DepositQuery {
    pub address_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DepositView {
    pub id: String,
    pub address_id: String,
    pub status: DepositTxStatus,
    pub confirmations: u32,
    pub required_confirmations: u32,
    pub tx_hash: Option<String>,
    pub amount: String,
    pub usd_value: f64,
    pub failure_reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<DepositTransaction> for DepositView {
    fn from(d: DepositTransaction) -> Self {
        Self {
            id: d.id,
            address_id: d.address_id,
            status: d.status,
            confirmations: d.confirmations,
            required_confirmations: d.required_confirmations,
            tx_hash: d.tx_hash,
            amount: d.amount.to_string(),
            usd_value: d.usd_value,
            failure_reason: d.failure_reason,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

/// GET /api/deposits?address_id=&status=
pub async fn handle_list(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
    Query(query): Query<DepositQuery>,
) -> Result<Json<Vec<DepositView>>, ApiError> {
    operator(&state, &headers)?;

    let status = match query.status.as_deref() {
        Some(s) => Some(s.parse::<DepositTxStatus>().map_err(ApiError::bad_request)?),
        None => None,
    };
    let deposits = match query.address_id.as_deref() {
        Some(id) => state.store.deposits_for_address(id).await,
        None => state.store.list_deposits().await,
    }
    .map_err(crate::common::CustodyError::from)?;

    Ok(Json(
        deposits
            .into_iter()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .map(DepositView::from)
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::create_router;
    use super::super::test_support::*;
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {}", OPERATOR))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_lists_and_filters_deposits() {
        let app = test_app();
        let mut failed = DepositTransaction::new("addr_a", 7, 3, "key-1");
        failed.mark_failed("reorg");
        app.store.insert_deposit(&failed).await.unwrap();
        app.store
            .insert_deposit(&DepositTransaction::new("addr_b", 9, 3, "key-2"))
            .await
            .unwrap();
        let router = create_router(app.state);

        let all = router.clone().oneshot(get("/api/deposits")).await.unwrap();
        assert_eq!(all.status(), StatusCode::OK);
        let bytes = to_bytes(all.into_body(), usize::MAX).await.unwrap();
        let all: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);

        let filtered = router
            .clone()
            .oneshot(get("/api/deposits?status=failed"))
            .await
            .unwrap();
        let bytes = to_bytes(filtered.into_body(), usize::MAX).await.unwrap();
        let filtered: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(filtered.as_array().unwrap().len(), 1);
        assert_eq!(filtered[0]["amount"], "7");
        assert_eq!(filtered[0]["required_confirmations"], 3);

        let bad = router.oneshot(get("/api/deposits?status=lost")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }
}
