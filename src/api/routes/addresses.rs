//! Deposit address endpoints

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{operator, principal};
use crate::api::auth::{AuthError, Principal};
use crate::api::middleware::ApiError;
use crate::api::server::SharedAppState;
use crate::common::error::CustodyError;
use crate::types::DepositAddress;

#[derive(Debug, Deserialize)]
pub struct GetOrCreateRequest {
    /// Required for operators; gateway callers are bound to `x-user-id`
    #[serde(default)]
    pub user_id: Option<String>,
    pub asset_id: String,
    pub network_id: String,
}

#[derive(Debug, Serialize)]
pub struct GetOrCreateResponse {
    pub id: String,
    pub address: String,
    pub asset_id: String,
    pub network_id: String,
    pub created_at: u64,
    pub created: bool,
}

/// Operator view of one address
#[derive(Debug, Serialize)]
pub struct AddressSummary {
    pub id: String,
    pub owner_user_id: String,
    pub address: String,
    pub asset_id: String,
    pub network_id: String,
    pub is_active: bool,
    /// Decimal string, base units
    pub last_balance: String,
    pub last_used_at: Option<u64>,
    pub created_at: u64,
}

impl From<DepositAddress> for AddressSummary {
    fn from(a: DepositAddress) -> Self {
        Self {
            id: a.id,
            owner_user_id: a.owner_user_id,
            address: a.address,
            asset_id: a.asset_id,
            network_id: a.network_id,
            is_active: a.is_active,
            last_balance: a.last_balance.to_string(),
            last_used_at: a.last_used_at,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

/// POST /api/deposit-addresses
pub async fn handle_get_or_create(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
    Json(req): Json<GetOrCreateRequest>,
) -> Result<(StatusCode, Json<GetOrCreateResponse>), ApiError> {
    let user_id = match principal(&state, &headers)? {
        Principal::Operator => req
            .user_id
            .clone()
            .ok_or_else(|| ApiError::bad_request("user_id is required"))?,
        Principal::User(user) => {
            if req.user_id.as_deref().is_some_and(|u| u != user) {
                return Err(AuthError::Forbidden.into());
            }
            user
        }
    };

    let provisioned = match state
        .addresses
        .get_or_create_address(&user_id, &req.asset_id, &req.network_id)
        .await
    {
        Ok(provisioned) => provisioned,
        // The tuple keeps its one address; only an operator can bring it back
        Err(CustodyError::Conflict(_)) => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "ADDRESS_DEACTIVATED",
                format!(
                    "the {} deposit address on {} is deactivated; an operator must reactivate it \
                     (PATCH /api/deposit-addresses/:id with is_active=true)",
                    req.asset_id, req.network_id
                ),
            ))
        }
        Err(e) => return Err(e.into()),
    };
    let status = if provisioned.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let a = provisioned.address;

    Ok((
        status,
        Json(GetOrCreateResponse {
            id: a.id,
            address: a.address,
            asset_id: a.asset_id,
            network_id: a.network_id,
            created_at: a.created_at,
            created: provisioned.created,
        }),
    ))
}

/// GET /api/deposit-addresses
pub async fn handle_list(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AddressSummary>>, ApiError> {
    operator(&state, &headers)?;
    let addresses = state.addresses.list().await?;
    Ok(Json(addresses.into_iter().map(AddressSummary::from).collect()))
}

/// PATCH /api/deposit-addresses/:id
pub async fn handle_set_active(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetActiveRequest>,
) -> Result<Json<AddressSummary>, ApiError> {
    operator(&state, &headers)?;
    let updated = state.addresses.set_active(&id, req.is_active).await?;
    Ok(Json(updated.into()))
}

/// DELETE /api/deposit-addresses/:id
pub async fn handle_delete(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    operator(&state, &headers)?;
    state.addresses.delete_address(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::super::create_router;
    use super::super::test_support::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn provision(token: &str, user_header: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/deposit-addresses")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", token));
        if let Some(user) = user_header {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_user_provisioning_is_idempotent() {
        let app = create_router(test_app().state);
        let body = serde_json::json!({ "asset_id": "eth", "network_id": "eth-devnet" });

        let first = app
            .clone()
            .oneshot(provision(GATEWAY, Some("user_1"), body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let first = json(first).await;
        assert_eq!(first["created"], true);
        assert!(first.get("key_handle").is_none());

        let second = app
            .oneshot(provision(GATEWAY, Some("user_1"), body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let second = json(second).await;
        assert_eq!(second["address"], first["address"]);
        assert_eq!(second["created"], false);
    }

    #[tokio::test]
    async fn test_user_cannot_provision_for_someone_else() {
        let app = create_router(test_app().state);
        let response = app
            .oneshot(provision(
                GATEWAY,
                Some("user_1"),
                serde_json::json!({ "user_id": "user_2", "asset_id": "eth", "network_id": "eth-devnet" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unsupported_pair_is_bad_request() {
        let app = create_router(test_app().state);
        let response = app
            .oneshot(provision(
                OPERATOR,
                None,
                serde_json::json!({ "user_id": "user_1", "asset_id": "doge", "network_id": "eth-devnet" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_listing_is_operator_only() {
        let app = create_router(test_app().state);

        let as_user = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/deposit-addresses")
                    .header("authorization", format!("Bearer {}", GATEWAY))
                    .header("x-user-id", "user_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(as_user.status(), StatusCode::FORBIDDEN);

        let as_operator = app
            .oneshot(
                Request::builder()
                    .uri("/api/deposit-addresses")
                    .header("authorization", format!("Bearer {}", OPERATOR))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(as_operator.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deactivate_and_delete() {
        let app = create_router(test_app().state);
        let created = json(
            app.clone()
                .oneshot(provision(
                    OPERATOR,
                    None,
                    serde_json::json!({ "user_id": "user_1", "asset_id": "btc", "network_id": "btc-regtest" }),
                ))
                .await
                .unwrap(),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let patched = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri(format!("/api/deposit-addresses/{}", id))
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {}", OPERATOR))
                    .body(Body::from(r#"{"is_active":false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(patched.status(), StatusCode::OK);
        assert_eq!(json(patched).await["is_active"], false);

        let again = app
            .clone()
            .oneshot(provision(
                OPERATOR,
                None,
                serde_json::json!({ "user_id": "user_1", "asset_id": "btc", "network_id": "btc-regtest" }),
            ))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
        let again = json(again).await;
        assert_eq!(again["code"], "ADDRESS_DEACTIVATED");
        assert!(again["error"].as_str().unwrap().contains("operator must reactivate"));

        let deleted = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/deposit-addresses/{}", id))
                    .header("authorization", format!("Bearer {}", OPERATOR))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    }
}
