//! API Server Module
//!
//! Application state and server startup.

use std::future::Future;
use std::sync::Arc;

use super::auth::Authorizer;
use super::routes::create_router;
use crate::common::Deployment;
use crate::deposit::DepositAddressManager;
use crate::registry::{MasterWalletRegistry, NetworkRegistry};
use crate::storage::CustodyStore;
use crate::sweep::SweepOrchestrator;

/// Application state shared by every handler
pub struct AppState {
    pub deployment: Deployment,
    pub networks: Arc<NetworkRegistry>,
    pub store: Arc<dyn CustodyStore>,
    pub addresses: Arc<DepositAddressManager>,
    pub wallets: Arc<MasterWalletRegistry>,
    pub sweeper: Arc<SweepOrchestrator>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// Shared application state type
pub type SharedAppState = Arc<AppState>;

/// Serve the API until `shutdown` resolves
pub async fn start_server<F>(state: SharedAppState, port: u16, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    println!("=== Custody API ===");
    println!("Listening on http://{}", addr);
    println!();
    println!("Endpoints:");
    println!("  GET    /api/health                 - Health check");
    println!("  GET    /api/networks               - Supported networks");
    println!("  POST   /api/deposit-addresses      - Get or create a deposit address");
    println!("  GET    /api/deposit-addresses      - List deposit addresses (operator)");
    println!("  PATCH  /api/deposit-addresses/:id  - Activate/deactivate (operator)");
    println!("  DELETE /api/deposit-addresses/:id  - Delete an empty address (operator)");
    println!("  GET    /api/deposits               - Deposit transactions (operator)");
    println!("  POST   /api/sweeps                 - Sweep addresses (operator)");
    println!("  GET    /api/sweeps                 - Sweep audit log (operator)");
    println!("  POST   /api/master-wallets         - Register a master wallet (operator)");
    println!("  GET    /api/master-wallets         - List master wallets (operator)");
    println!("  PATCH  /api/master-wallets/:id     - Activate/deactivate (operator)");
    println!();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
