//! Master wallet endpoints

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use super::operator;
use crate::api::middleware::ApiError;
use crate::api::server::SharedAppState;
use crate::types::MasterWallet;

#[derive(Debug, Deserialize)]
pub struct CreateWalletRequest {
    pub network_id: String,
    pub label: String,
    pub symbol: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

/// POST /api/master-wallets
pub async fn handle_create(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
    Json(req): Json<CreateWalletRequest>,
) -> Result<(StatusCode, Json<MasterWallet>), ApiError> {
    operator(&state, &headers)?;
    let wallet = state
        .wallets
        .create(&req.network_id, &req.label, &req.symbol, &req.address)
        .await?;
    Ok((StatusCode::CREATED, Json(wallet)))
}

/// GET /api/master-wallets
pub async fn handle_list(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<MasterWallet>>, ApiError> {
    operator(&state, &headers)?;
    Ok(Json(state.wallets.list().await?))
}

/// PATCH /api/master-wallets/:id
pub async fn handle_set_active(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetActiveRequest>,
) -> Result<Json<MasterWallet>, ApiError> {
    operator(&state, &headers)?;
    Ok(Json(state.wallets.set_active(&id, req.is_active).await?))
}
