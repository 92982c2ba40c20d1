//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the custody backend.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{ConfigError, CustodyConfig, Deployment};
pub use error::{CustodyError, Result};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_alert, log_api_response,
    log_deposit_event, log_security_event, log_sweep_event, EventCategory, LogEvent, LogLevel,
    LoggingError,
};

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
