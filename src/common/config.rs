//! Environment-based Configuration for the Custody Backend
//!
//! Secrets (key store passphrase, API tokens) come from environment variables
//! only, never from the network catalog or hardcoded values. A `.env` file is
//! honoured when the binary calls `dotenv` before [`CustodyConfig::from_env`].
//!
//! # Environment Variables
//!
//! ## Deployment
//! - `CUSTODY_DEPLOYMENT` - "mainnet", "testnet", or "devnet" (default: "devnet")
//! - `CUSTODY_NETWORKS_FILE` - TOML network catalog (default: built-in catalog)
//! - `CUSTODY_DATABASE_PATH` - SQLite database file
//!
//! ## Key Store
//! - `CUSTODY_KEYSTORE_DIR` - Directory holding encrypted key files
//! - `CUSTODY_KEYSTORE_PASSPHRASE` - Encryption passphrase (devnet has a default)
//!
//! ## Collaborators
//! - `CUSTODY_LEDGER_URL` - Ledger service base URL (devnet: in-memory ledger)
//! - `CUSTODY_FX_URL` - FX rate feed base URL (default: fixed rates)
//! - `CUSTODY_OPERATOR_TOKENS` - Comma separated operator bearer tokens
//! - `CUSTODY_GATEWAY_TOKEN` - Token presented by the user-facing gateway
//!
//! ## Tuning
//! - `CUSTODY_API_PORT` (default 3002)
//! - `CUSTODY_RPC_TIMEOUT_SECS` (default 10)
//! - `CUSTODY_SWEEP_TIMEOUT_SECS` (default 60)
//! - `CUSTODY_POLL_FACTOR` (default 1.0)
//! - `CUSTODY_MAX_BACKOFF_SECS` (default 300)
//! - `CUSTODY_ALERT_AFTER` (default 5)
//! - `CUSTODY_LOG_LEVEL` (default "info")

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Passphrase used when none is configured on devnet.
const DEVNET_PASSPHRASE: &str = "custody-devnet-passphrase";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("deployment mismatch: expected {0}, got {1}")]
    DeploymentMismatch(String, String),

    #[error("insecure setting for production: {0}")]
    Insecure(String),

    #[error("failed to read {0}: {1}")]
    File(String, String),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Deployment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Deployment::Mainnet),
            "testnet" | "test" => Ok(Deployment::Testnet),
            "devnet" | "dev" => Ok(Deployment::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "CUSTODY_DEPLOYMENT".to_string(),
                format!("unknown deployment: {}", s),
            )),
        }
    }
}

impl std::fmt::Display for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Deployment::Mainnet => "mainnet",
            Deployment::Testnet => "testnet",
            Deployment::Devnet => "devnet",
        };
        write!(f, "{}", s)
    }
}

impl Deployment {
    /// Bitcoin network used for address encoding on this deployment
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Deployment::Mainnet => bitcoin::Network::Bitcoin,
            Deployment::Testnet | Deployment::Devnet => bitcoin::Network::Testnet,
        }
    }

    /// Whether the simulated chain and in-memory collaborators may be used
    pub fn allows_simulation(&self) -> bool {
        matches!(self, Deployment::Devnet)
    }
}

/// Main configuration struct
#[derive(Clone)]
pub struct CustodyConfig {
    pub deployment: Deployment,
    pub database_path: PathBuf,
    pub networks_file: Option<PathBuf>,
    pub keystore_dir: PathBuf,
    pub keystore_passphrase: String,
    pub ledger_url: Option<String>,
    pub fx_url: Option<String>,
    pub operator_tokens: Vec<String>,
    pub gateway_token: Option<String>,
    pub api_port: u16,
    pub rpc_timeout: Duration,
    pub sweep_timeout: Duration,
    /// Multiplier applied to a network's block time to get its poll interval
    pub poll_factor: f64,
    pub max_backoff: Duration,
    /// Consecutive poll failures before an operational alert fires
    pub alert_after_failures: u32,
    pub log_level: String,
}

// Secrets stay out of Debug output.
impl std::fmt::Debug for CustodyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyConfig")
            .field("deployment", &self.deployment)
            .field("database_path", &self.database_path)
            .field("networks_file", &self.networks_file)
            .field("keystore_dir", &self.keystore_dir)
            .field("ledger_url", &self.ledger_url)
            .field("fx_url", &self.fx_url)
            .field("operator_tokens", &self.operator_tokens.len())
            .field("api_port", &self.api_port)
            .finish_non_exhaustive()
    }
}

impl CustodyConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let deployment: Deployment = env::var("CUSTODY_DEPLOYMENT")
            .unwrap_or_else(|_| "devnet".to_string())
            .parse()?;

        let database_path = env::var("CUSTODY_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/custody.db"));

        let networks_file = env::var("CUSTODY_NETWORKS_FILE").ok().map(PathBuf::from);

        let keystore_dir = env::var("CUSTODY_KEYSTORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/keys"));

        let keystore_passphrase = get_required_or_devnet_default(
            "CUSTODY_KEYSTORE_PASSPHRASE",
            DEVNET_PASSPHRASE,
            deployment,
        )?;

        let ledger_url = env::var("CUSTODY_LEDGER_URL").ok().filter(|v| !v.is_empty());
        if ledger_url.is_none() && !deployment.allows_simulation() {
            return Err(ConfigError::MissingEnvVar("CUSTODY_LEDGER_URL".to_string()));
        }

        let fx_url = env::var("CUSTODY_FX_URL").ok().filter(|v| !v.is_empty());

        let operator_tokens = env::var("CUSTODY_OPERATOR_TOKENS")
            .map(|v| parse_token_list(&v))
            .unwrap_or_default();

        let gateway_token = env::var("CUSTODY_GATEWAY_TOKEN").ok().filter(|v| !v.is_empty());

        let api_port = parse_or("CUSTODY_API_PORT", 3002u16)?;
        let rpc_timeout = Duration::from_secs(parse_or("CUSTODY_RPC_TIMEOUT_SECS", 10u64)?);
        let sweep_timeout = Duration::from_secs(parse_or("CUSTODY_SWEEP_TIMEOUT_SECS", 60u64)?);
        let poll_factor = parse_or("CUSTODY_POLL_FACTOR", 1.0f64)?;
        if !(poll_factor > 0.0) {
            return Err(ConfigError::InvalidValue(
                "CUSTODY_POLL_FACTOR".to_string(),
                "must be positive".to_string(),
            ));
        }
        let max_backoff = Duration::from_secs(parse_or("CUSTODY_MAX_BACKOFF_SECS", 300u64)?);
        let alert_after_failures = parse_or("CUSTODY_ALERT_AFTER", 5u32)?;

        let log_level = env::var("CUSTODY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            deployment,
            database_path,
            networks_file,
            keystore_dir,
            keystore_passphrase,
            ledger_url,
            fx_url,
            operator_tokens,
            gateway_token,
            api_port,
            rpc_timeout,
            sweep_timeout,
            poll_factor,
            max_backoff,
            alert_after_failures,
            log_level,
        })
    }

    /// Defaults for local development and tests
    pub fn devnet() -> Self {
        Self {
            deployment: Deployment::Devnet,
            database_path: PathBuf::from("data/custody.db"),
            networks_file: None,
            keystore_dir: PathBuf::from("data/keys"),
            keystore_passphrase: DEVNET_PASSPHRASE.to_string(),
            ledger_url: None,
            fx_url: None,
            operator_tokens: Vec::new(),
            gateway_token: None,
            api_port: 3002,
            rpc_timeout: Duration::from_secs(10),
            sweep_timeout: Duration::from_secs(60),
            poll_factor: 1.0,
            max_backoff: Duration::from_secs(300),
            alert_after_failures: 5,
            log_level: "info".to_string(),
        }
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.deployment != Deployment::Mainnet {
            return Err(ConfigError::DeploymentMismatch(
                "mainnet".to_string(),
                self.deployment.to_string(),
            ));
        }

        if self.keystore_passphrase == DEVNET_PASSPHRASE || self.keystore_passphrase.len() < 16 {
            return Err(ConfigError::Insecure(
                "key store passphrase must be set and at least 16 characters".to_string(),
            ));
        }

        if self.ledger_url.is_none() {
            return Err(ConfigError::MissingEnvVar("CUSTODY_LEDGER_URL".to_string()));
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingEnvVar("CUSTODY_OPERATOR_TOKENS".to_string()));
        }

        Ok(())
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== Custody Configuration ===");
        println!("Deployment: {}", self.deployment);
        println!("Database: {}", self.database_path.display());
        println!(
            "Networks: {}",
            self.networks_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in catalog".to_string())
        );
        println!("Key Store: {}", self.keystore_dir.display());
        println!(
            "Ledger: {}",
            self.ledger_url.as_deref().unwrap_or("in-memory (devnet)")
        );
        println!("FX Feed: {}", self.fx_url.as_deref().unwrap_or("fixed rates"));
        println!("Operator Tokens: {}", self.operator_tokens.len());
        println!("API Port: {}", self.api_port);
        println!("RPC Timeout: {}s", self.rpc_timeout.as_secs());
        println!("Log Level: {}", self.log_level);
        println!("=============================");
    }
}

/// Get required env var, or use default for devnet only
fn get_required_or_devnet_default(
    var_name: &str,
    devnet_default: &str,
    deployment: Deployment,
) -> Result<String, ConfigError> {
    match env::var(var_name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => {
            if deployment == Deployment::Devnet {
                Ok(devnet_default.to_string())
            } else {
                Err(ConfigError::MissingEnvVar(var_name.to_string()))
            }
        }
    }
}

fn parse_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), format!("cannot parse '{}'", value))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_token_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}
