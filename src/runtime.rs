//! Service wiring
//!
//! Builds every component from a [`CustodyConfig`] and hands out the
//! pieces the binary runs: the API state and the watcher supervisor.

use std::sync::Arc;

use crate::api::{AppState, SharedAppState, TokenAuthorizer};
use crate::chain::ChainClients;
use crate::collaborators::{FixedRateFeed, FxRateFeed, HttpLedger, HttpRateFeed, InMemoryLedger, Ledger};
use crate::common::error::{CustodyError, Result};
use crate::common::CustodyConfig;
use crate::deposit::{
    AddressLocks, DepositAddressManager, DepositWatcher, SchedulerConfig, WatcherSupervisor,
};
use crate::keystore::{EncryptedKeyStore, KeyStore};
use crate::registry::{MasterWalletRegistry, NetworkRegistry};
use crate::storage::{CustodyStore, SqliteCustodyStore};
use crate::sweep::{SweepOrchestrator, SweepTimeouts};

/// External dependencies of the core services
pub struct Backends {
    pub networks: Arc<NetworkRegistry>,
    pub store: Arc<dyn CustodyStore>,
    pub keystore: Arc<dyn KeyStore>,
    pub chains: ChainClients,
    pub ledger: Arc<dyn Ledger>,
    pub fx: Arc<dyn FxRateFeed>,
}

/// Fully wired custody services
pub struct CustodyServices {
    pub config: CustodyConfig,
    pub networks: Arc<NetworkRegistry>,
    pub store: Arc<dyn CustodyStore>,
    pub locks: Arc<AddressLocks>,
    pub watcher: Arc<DepositWatcher>,
    pub addresses: Arc<DepositAddressManager>,
    pub wallets: Arc<MasterWalletRegistry>,
    pub sweeper: Arc<SweepOrchestrator>,
}

impl CustodyServices {
    /// Open the configured database, key store, chains and collaborators
    pub fn from_config(config: CustodyConfig) -> Result<Self> {
        let networks = Arc::new(match &config.networks_file {
            Some(path) => NetworkRegistry::from_toml_file(path)?,
            None => NetworkRegistry::builtin(config.deployment),
        });

        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store: Arc<dyn CustodyStore> = Arc::new(SqliteCustodyStore::new(&config.database_path)?);
        let keystore: Arc<dyn KeyStore> = Arc::new(EncryptedKeyStore::open(
            &config.keystore_dir,
            config.keystore_passphrase.clone(),
        )?);
        let chains = ChainClients::for_networks(networks.list(), config.rpc_timeout);

        let ledger: Arc<dyn Ledger> = match &config.ledger_url {
            Some(url) => Arc::new(HttpLedger::new(url, config.rpc_timeout)),
            None if config.deployment.allows_simulation() => {
                tracing::warn!(target: "custody::system", "No ledger URL configured, crediting an in-memory ledger");
                Arc::new(InMemoryLedger::new())
            }
            None => return Err(CustodyError::internal("ledger URL is required outside devnet")),
        };
        let fx: Arc<dyn FxRateFeed> = match &config.fx_url {
            Some(url) => Arc::new(HttpRateFeed::new(url, config.rpc_timeout)),
            None => Arc::new(FixedRateFeed::devnet()),
        };

        Ok(Self::assemble(
            config,
            Backends {
                networks,
                store,
                keystore,
                chains,
                ledger,
                fx,
            },
        ))
    }

    /// Wire the services over the given backends
    pub fn assemble(config: CustodyConfig, backends: Backends) -> Self {
        let Backends {
            networks,
            store,
            keystore,
            chains,
            ledger,
            fx,
        } = backends;
        let locks = AddressLocks::new();

        let watcher = Arc::new(DepositWatcher::new(
            store.clone(),
            networks.clone(),
            chains.clone(),
            ledger,
            fx,
            locks.clone(),
            config.rpc_timeout,
        ));
        let addresses = Arc::new(DepositAddressManager::new(
            store.clone(),
            networks.clone(),
            keystore.clone(),
            locks.clone(),
        ));
        let wallets = Arc::new(MasterWalletRegistry::new(store.clone(), networks.clone()));
        let sweeper = Arc::new(SweepOrchestrator::new(
            store.clone(),
            networks.clone(),
            chains,
            keystore,
            locks.clone(),
            watcher.clone(),
            SweepTimeouts {
                rpc: config.rpc_timeout,
                per_address: config.sweep_timeout,
            },
        ));

        Self {
            config,
            networks,
            store,
            locks,
            watcher,
            addresses,
            wallets,
            sweeper,
        }
    }

    /// A stopped supervisor over this service's watcher
    pub fn supervisor(&self) -> WatcherSupervisor {
        WatcherSupervisor::new(self.watcher.clone(), SchedulerConfig::from(&self.config))
    }

    pub fn app_state(&self) -> SharedAppState {
        if self.config.operator_tokens.is_empty() {
            tracing::warn!(target: "custody::security", "No operator tokens configured, operator routes are unreachable");
        }
        Arc::new(AppState {
            deployment: self.config.deployment,
            networks: self.networks.clone(),
            store: self.store.clone(),
            addresses: self.addresses.clone(),
            wallets: self.wallets.clone(),
            sweeper: self.sweeper.clone(),
            authorizer: Arc::new(TokenAuthorizer::new(
                &self.config.operator_tokens,
                self.config.gateway_token.as_deref(),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_devnet() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CustodyConfig::devnet();
        config.database_path = dir.path().join("db/custody.db");
        config.keystore_dir = dir.path().join("keys");
        config.operator_tokens = vec!["op".to_string()];

        let services = CustodyServices::from_config(config).unwrap();
        let provisioned = services
            .addresses
            .get_or_create_address("user_1", "btc", "btc-regtest")
            .await
            .unwrap();
        assert!(provisioned.created);
        assert!(provisioned.address.address.starts_with("bcrt1"));

        let supervisor = services.supervisor();
        assert!(!supervisor.is_running());
        assert_eq!(services.app_state().deployment, crate::common::Deployment::Devnet);
    }

    #[test]
    fn test_from_config_requires_ledger_outside_devnet() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CustodyConfig::devnet();
        config.deployment = crate::common::Deployment::Testnet;
        config.database_path = dir.path().join("custody.db");
        config.keystore_dir = dir.path().join("keys");

        assert!(CustodyServices::from_config(config).is_err());
    }
}
