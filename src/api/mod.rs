//! API Layer Module
//!
//! HTTP server, routes, authorization and middleware.

pub mod auth;
pub mod middleware;
pub mod routes;
pub mod server;

// Re-exports for convenience
pub use auth::{Authorizer, AuthError, Principal, TokenAuthorizer};
pub use middleware::ApiError;
pub use routes::create_router;
pub use server::{start_server, AppState, SharedAppState};
