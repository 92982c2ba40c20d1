//! Common Error Types for the Custody Backend
//!
//! Module-local errors (storage, chain, key store, ledger) convert into
//! [`CustodyError`], which carries the taxonomy the API maps to status codes.

use thiserror::Error;

use crate::chain::ChainError;
use crate::collaborators::ledger::LedgerError;
use crate::keystore::KeyStoreError;
use crate::storage::StorageError;

/// Root error type for the custody backend
#[derive(Debug, Error)]
pub enum CustodyError {
    /// Malformed input, unknown enum value, inactive network
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or state conflict (duplicate master wallet, delete with balance)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing per-network setup such as a master wallet
    #[error("configuration error on {network_id}: {message}")]
    Configuration { network_id: String, message: String },

    /// Not enough native currency for fees
    #[error("insufficient resource: {message} (required {required})")]
    InsufficientResource { required: u128, message: String },

    /// RPC timeout or connection failure
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Authorization failure
    #[error("security error: {0}")]
    Security(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CustodyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn configuration(network_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            network_id: network_id.into(),
            message: msg.into(),
        }
    }

    pub fn insufficient(required: u128, msg: impl Into<String>) -> Self {
        Self::InsufficientResource {
            required,
            message: msg.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CustodyError::TransientNetwork(_) | CustodyError::Storage(_) | CustodyError::Io(_)
        )
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            CustodyError::Validation(_) => "VALIDATION_ERROR",
            CustodyError::NotFound(_) => "NOT_FOUND",
            CustodyError::Conflict(_) => "CONFLICT",
            CustodyError::Configuration { .. } => "CONFIGURATION_ERROR",
            CustodyError::InsufficientResource { .. } => "INSUFFICIENT_RESOURCE",
            CustodyError::TransientNetwork(_) => "TRANSIENT_NETWORK_ERROR",
            CustodyError::Security(_) => "SECURITY_ERROR",
            CustodyError::Storage(_) => "STORAGE_ERROR",
            CustodyError::Config(_) => "CONFIG_ERROR",
            CustodyError::Logging(_) => "LOGGING_ERROR",
            CustodyError::Internal(_) => "INTERNAL_ERROR",
            CustodyError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<StorageError> for CustodyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => CustodyError::NotFound(id),
            StorageError::Duplicate(key) => CustodyError::Conflict(format!("duplicate record: {}", key)),
            StorageError::InvalidData(msg) => CustodyError::Internal(msg),
            StorageError::Database(msg) | StorageError::Connection(msg) => CustodyError::Storage(msg),
        }
    }
}

impl From<ChainError> for CustodyError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Timeout(_) | ChainError::Request(_) | ChainError::Rpc(_) => {
                CustodyError::TransientNetwork(err.to_string())
            }
            ChainError::InvalidAddress(msg) => CustodyError::Validation(msg),
            ChainError::Unsupported(msg) => CustodyError::Internal(msg),
            ChainError::InvalidResponse(_) | ChainError::Build(_) | ChainError::Signing(_) => {
                CustodyError::Internal(err.to_string())
            }
        }
    }
}

impl From<KeyStoreError> for CustodyError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::UnknownHandle(h) => CustodyError::NotFound(format!("key handle {}", h)),
            KeyStoreError::Io(e) => CustodyError::Io(e),
            other => CustodyError::Internal(other.to_string()),
        }
    }
}

impl From<LedgerError> for CustodyError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(msg) => CustodyError::TransientNetwork(msg),
            LedgerError::Rejected(msg) => CustodyError::Internal(format!("ledger rejected credit: {}", msg)),
        }
    }
}

/// Result type alias using CustodyError
pub type Result<T> = std::result::Result<T, CustodyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CustodyError::configuration("eth-mainnet", "master wallet not configured");
        assert!(err.to_string().contains("eth-mainnet"));
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(CustodyError::transient("timeout").is_retryable());
        assert!(CustodyError::storage("locked").is_retryable());
        assert!(!CustodyError::validation("invalid input").is_retryable());
        assert!(!CustodyError::conflict("exists").is_retryable());
    }

    #[test]
    fn test_storage_duplicate_maps_to_conflict() {
        let err: CustodyError = StorageError::Duplicate("addr".to_string()).into();
        assert!(matches!(err, CustodyError::Conflict(_)));
    }

    #[test]
    fn test_chain_timeout_is_transient() {
        let err: CustodyError = ChainError::Timeout("eth_getBalance".to_string()).into();
        assert!(err.is_retryable());
    }
}
