//! API Middleware - Error Responses and Request Logging

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Instant;

use super::auth::AuthError;
use crate::common::{generate_correlation_id, log_api_response, CustodyError};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

// ============================================================================
// Error Responses
// ============================================================================

/// JSON error body returned by every handler
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            code,
            network_id: None,
            required: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", error)
    }
}

/// HTTP status for each error kind
pub fn status_for(err: &CustodyError) -> StatusCode {
    match err {
        CustodyError::Validation(_) => StatusCode::BAD_REQUEST,
        CustodyError::NotFound(_) => StatusCode::NOT_FOUND,
        CustodyError::Conflict(_) => StatusCode::CONFLICT,
        CustodyError::Configuration { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CustodyError::InsufficientResource { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CustodyError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
        CustodyError::Security(_) => StatusCode::FORBIDDEN,
        CustodyError::Storage(_)
        | CustodyError::Config(_)
        | CustodyError::Logging(_)
        | CustodyError::Internal(_)
        | CustodyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CustodyError> for ApiError {
    fn from(err: CustodyError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(target: "custody::api", error = %err, "Request failed");
        }

        let mut api = Self::new(status, err.error_code(), err.to_string());
        match err {
            CustodyError::Configuration { network_id, .. } => api.network_id = Some(network_id),
            CustodyError::InsufficientResource { required, .. } => {
                api.required = Some(required.to_string())
            }
            _ => {}
        }
        api
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        };
        Self::new(status, "SECURITY_ERROR", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

// ============================================================================
// Request Logging
// ============================================================================

/// Tag each request with a correlation id and log its outcome
pub async fn request_logging(request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_correlation_id);
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;

    log_api_response(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_millis() as u64,
        &correlation_id,
    );
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
