//! API Routes Module
//!
//! Route handlers organized by domain:
//! - addresses: deposit address provisioning and administration
//! - deposits: deposit transaction reads
//! - sweeps: sweep batches and the sweep audit log
//! - wallets: master wallet registry

pub mod addresses;
pub mod deposits;
pub mod sweeps;
pub mod wallets;

use axum::{
    extract::State,
    http::HeaderMap,
    middleware,
    routing::{get, patch},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use super::auth::{require_operator, Principal};
use super::middleware::{request_logging, ApiError};
use super::server::{AppState, SharedAppState};
use crate::types::Network;

/// Build the full API router
pub fn create_router(state: SharedAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/networks", get(handle_networks))
        .route(
            "/api/deposit-addresses",
            get(addresses::handle_list).post(addresses::handle_get_or_create),
        )
        .route(
            "/api/deposit-addresses/:id",
            patch(addresses::handle_set_active).delete(addresses::handle_delete),
        )
        .route("/api/deposits", get(deposits::handle_list))
        .route("/api/sweeps", get(sweeps::handle_audit_log).post(sweeps::handle_sweep))
        .route(
            "/api/master-wallets",
            get(wallets::handle_list).post(wallets::handle_create),
        )
        .route("/api/master-wallets/:id", patch(wallets::handle_set_active))
        .layer(middleware::from_fn(request_logging))
        .layer(cors)
        .with_state(state)
}

/// Authenticate the caller
pub(crate) fn principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    Ok(state.authorizer.authorize(headers)?)
}

/// Authenticate and require the operator role
pub(crate) fn operator(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let principal = principal(state, headers)?;
    Ok(require_operator(&principal)?)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    deployment: String,
    networks: usize,
}

/// GET /api/health
async fn handle_health(State(state): State<SharedAppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        deployment: state.deployment.to_string(),
        networks: state.networks.network_ids().len(),
    })
}

/// GET /api/networks
///
/// Active catalog entries; any authenticated caller.
async fn handle_networks(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Network>>, ApiError> {
    principal(&state, &headers)?;
    Ok(Json(
        state.networks.list().iter().filter(|n| n.active).cloned().collect(),
    ))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-correlation-id"));
    }

    #[tokio::test]
    async fn test_networks_requires_auth() {
        let app = create_router(test_app().state);

        let anonymous = app
            .clone()
            .oneshot(Request::builder().uri("/api/networks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let user = app
            .oneshot(
                Request::builder()
                    .uri("/api/networks")
                    .header("authorization", format!("Bearer {}", GATEWAY))
                    .header("x-user-id", "user_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(user.status(), StatusCode::OK);
    }
}
