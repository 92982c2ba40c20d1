//! Custody Backend - Deposit & Sweep Services
//!
//! Run modes:
//!   cargo run                    - Show usage
//!   cargo run -- api             - Start REST API (no deposit polling)
//!   cargo run -- watcher         - Start deposit watcher only
//!   cargo run -- serve           - Start REST API and deposit watcher
//!   cargo run -- demo            - Run simulated end-to-end demo

use custody::chain::{ChainClients, SimulatedChain};
use custody::collaborators::{FixedRateFeed, InMemoryLedger};
use custody::common::{init_from_config, CustodyConfig, Result};
use custody::keystore::EncryptedKeyStore;
use custody::registry::NetworkRegistry;
use custody::storage::MemoryCustodyStore;
use custody::types::to_display;
use custody::{api, Backends, CustodyServices, Deployment};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    let outcome = match args[1].as_str() {
        "api" => run_api_server(&args[2..]).await,
        "watcher" => run_watcher().await,
        "serve" => run_serve(&args[2..]).await,
        "demo" => run_demo().await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Custody Backend - Deposit & Sweep Services");
    println!();
    println!("Usage:");
    println!("  custody-api api [--port <port>]     Start REST API server (default: 3002)");
    println!("  custody-api watcher                 Start deposit watcher");
    println!("  custody-api serve [--port <port>]   Start REST API and deposit watcher");
    println!("  custody-api demo                    Run simulated end-to-end demo");
    println!();
    println!("Environment Variables:");
    println!("  CUSTODY_DEPLOYMENT           mainnet | testnet | devnet (default: devnet)");
    println!("  CUSTODY_DATABASE_PATH        SQLite database (default: data/custody.db)");
    println!("  CUSTODY_NETWORKS_FILE        TOML network catalog (default: built-in)");
    println!("  CUSTODY_KEYSTORE_DIR         Encrypted key directory (default: data/keys)");
    println!("  CUSTODY_KEYSTORE_PASSPHRASE  Key encryption passphrase (required outside devnet)");
    println!("  CUSTODY_LEDGER_URL           Ledger service base URL (required outside devnet)");
    println!("  CUSTODY_FX_URL               FX rate feed base URL (default: fixed rates)");
    println!("  CUSTODY_OPERATOR_TOKENS      Comma separated operator bearer tokens");
    println!("  CUSTODY_GATEWAY_TOKEN        Bearer token of the user-facing gateway");
    println!("  CUSTODY_API_PORT             REST API port (default: 3002)");
}

fn parse_port(args: &[String], default: u16) -> u16 {
    let mut port = default;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                port = args[i + 1].parse().unwrap_or(default);
                i += 2;
            }
            _ => i += 1,
        }
    }
    port
}

/// Load config from the environment and initialize logging
fn load_config() -> Result<CustodyConfig> {
    let config = CustodyConfig::from_env()?;
    init_from_config(&config)?;
    if config.deployment == Deployment::Mainnet {
        config.validate_for_production()?;
    }
    config.print_summary();
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(target: "custody::system", error = %e, "Failed to listen for Ctrl+C");
    }
    tracing::info!(target: "custody::system", "Shutdown requested");
}

/// Start REST API server
async fn run_api_server(args: &[String]) -> Result<()> {
    let config = load_config()?;
    let port = parse_port(args, config.api_port);
    let services = CustodyServices::from_config(config)?;

    api::start_server(services.app_state(), port, shutdown_signal()).await?;
    Ok(())
}

/// Start the deposit watcher and run until Ctrl+C
async fn run_watcher() -> Result<()> {
    let services = CustodyServices::from_config(load_config()?)?;
    let mut supervisor = services.supervisor();
    supervisor.start()?;

    println!("Watching {} networks for deposits...", services.networks.network_ids().len());
    println!("Press Ctrl+C to stop");
    println!();

    shutdown_signal().await;
    supervisor.stop().await;
    Ok(())
}

/// API and watcher in one process
async fn run_serve(args: &[String]) -> Result<()> {
    let config = load_config()?;
    let port = parse_port(args, config.api_port);
    let services = CustodyServices::from_config(config)?;

    let mut supervisor = services.supervisor();
    supervisor.start()?;
    let served = api::start_server(services.app_state(), port, shutdown_signal()).await;
    supervisor.stop().await;
    served?;
    Ok(())
}

async fn run_demo() -> Result<()> {
    println!("\n=== Custody Demo (simulated chain) ===\n");

    let networks = Arc::new(NetworkRegistry::builtin(Deployment::Devnet));
    let eth_chain = Arc::new(SimulatedChain::new(false));
    let btc_chain = Arc::new(SimulatedChain::new(true).with_fee(2_000));
    let mut chains = ChainClients::new();
    chains.insert("eth-devnet", eth_chain.clone());
    chains.insert("btc-regtest", btc_chain.clone());
    let ledger = Arc::new(InMemoryLedger::new());

    let services = CustodyServices::assemble(
        CustodyConfig::devnet(),
        Backends {
            networks,
            store: Arc::new(MemoryCustodyStore::new()),
            keystore: Arc::new(EncryptedKeyStore::ephemeral("demo")),
            chains,
            ledger: ledger.clone(),
            fx: Arc::new(FixedRateFeed::devnet()),
        },
    );

    // 1. Provision
    let eth = services
        .addresses
        .get_or_create_address("demo_user", "eth", "eth-devnet")
        .await?
        .address;
    let btc = services
        .addresses
        .get_or_create_address("demo_user", "btc", "btc-regtest")
        .await?
        .address;
    println!("1. PROVISION");
    println!("   ETH deposit address: {}", eth.address);
    println!("   BTC deposit address: {}", btc.address);
    println!();

    // 2. Deposit and confirm
    let eth_amount: u128 = 50_000_000_000_000_000;
    let btc_amount: u128 = 250_000;
    eth_chain.set_balance(&eth.address, eth_amount);
    btc_chain.deposit(&btc.address, btc_amount);
    println!("2. DEPOSIT");
    println!("   Sent {} and {}", to_display(eth_amount, 18, "ETH"), to_display(btc_amount, 8, "BTC"));

    for round in 0..2 {
        let eth_report = services.watcher.poll_address(&eth.id).await?;
        let btc_report = services.watcher.poll_address(&btc.id).await?;
        println!(
            "   Poll {}: eth detected={} completed={}, btc detected={} completed={}",
            round, eth_report.detected, eth_report.completed, btc_report.detected, btc_report.completed
        );
        eth_chain.mine(1);
        btc_chain.mine(1);
    }
    println!(
        "   Ledger: {} / {}",
        to_display(ledger.balance("demo_user", "eth"), 18, "ETH"),
        to_display(ledger.balance("demo_user", "btc"), 8, "BTC")
    );
    println!();

    // 3. Sweep
    println!("3. SWEEP");
    let ids = vec![eth.id.clone(), btc.id.clone()];
    for result in services.sweeper.sweep(&ids).await {
        println!("   {} -> {} ({})", result.address_id, result.status, result.message);
    }
    services
        .wallets
        .create("eth-devnet", "Treasury", "ETH", "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf")
        .await?;
    services
        .wallets
        .create("btc-regtest", "Treasury", "BTC", "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080")
        .await?;
    for result in services.sweeper.sweep(&ids).await {
        println!(
            "   {} -> {} {}",
            result.address_id,
            result.status,
            result.tx_hash.as_deref().unwrap_or(&result.message)
        );
    }
    println!();

    println!("=== Demo Complete ===");
    Ok(())
}
