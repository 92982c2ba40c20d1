//! Sweep endpoints

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use super::operator;
use crate::api::middleware::ApiError;
use crate::api::server::SharedAppState;
use crate::common::CustodyError;
use crate::storage::SweepAuditStore;
use crate::types::{SweepAuditRecord, SweepResult};

/// Largest accepted batch
pub const MAX_BATCH: usize = 500;

#[derive(Debug, Deserialize)]
pub struct SweepRequest {
    pub address_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub results: Vec<SweepResult>,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

/// POST /api/sweeps
///
/// Always 200 once authorized and well formed; per-address outcomes are in
/// `results`.
pub async fn handle_sweep(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
    Json(req): Json<SweepRequest>,
) -> Result<Json<SweepResponse>, ApiError> {
    operator(&state, &headers)?;
    if req.address_ids.is_empty() {
        return Err(ApiError::bad_request("address_ids must not be empty"));
    }
    if req.address_ids.len() > MAX_BATCH {
        return Err(ApiError::bad_request(format!(
            "at most {} addresses per sweep",
            MAX_BATCH
        )));
    }

    let results = state.sweeper.sweep(&req.address_ids).await;
    Ok(Json(SweepResponse { results }))
}

/// GET /api/sweeps?limit=
pub async fn handle_audit_log(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<SweepAuditRecord>>, ApiError> {
    operator(&state, &headers)?;
    let limit = query.limit.unwrap_or(100).min(1000);
    let records = state
        .store
        .list_sweeps(limit)
        .await
        .map_err(CustodyError::from)?;
    Ok(Json(records))
}
