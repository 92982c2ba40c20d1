//! Structured Logging for the Custody Backend
//!
//! Every credit, sweep result and security decision is emitted as a JSON
//! [`LogEvent`] under a `custody::<category>` target, so the log stream doubles
//! as an audit trail:
//!
//! - `custody::deposit` - detection, confirmation and crediting
//! - `custody::sweep` - one event per sweep result
//! - `custody::security` - authorization failures
//! - `custody::alert` - persistent RPC failures that need an operator
//!
//! # Usage
//!
//! ```rust,ignore
//! use custody::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?; // JSON mode for production
//! tracing::info!(target: "custody::api", request_id = %id, "Creating address");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::types::sweep::{SweepResult, SweepStatus};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// API request/response events
    Api,
    /// Deposit detection and crediting
    Deposit,
    /// Sweep results
    Sweep,
    /// Security events (auth failures)
    Security,
    /// Operational alerts
    Alert,
    /// System events (startup, shutdown)
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Render this event as a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": {:?}}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Event Helpers
// ============================================================================

/// Log a security-related event
pub fn log_security_event(
    event_type: &str,
    success: bool,
    details: serde_json::Value,
    correlation_id: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Security, event_type).with_data(
        serde_json::json!({
            "success": success,
            "details": details
        }),
    );

    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }

    if success {
        tracing::info!(target: "custody::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "custody::security", "{}", event.to_json());
    }
}

/// Log an API response
pub fn log_api_response(
    method: &str,
    path: &str,
    status: u16,
    duration_ms: u64,
    correlation_id: &str,
) {
    let level = if status >= 500 {
        LogLevel::Error
    } else if status >= 400 {
        LogLevel::Warn
    } else {
        LogLevel::Info
    };

    let event = LogEvent::new(
        level,
        EventCategory::Api,
        format!("{} {} -> {}", method, path, status),
    )
    .with_correlation_id(correlation_id)
    .with_duration(duration_ms)
    .with_data(serde_json::json!({
        "method": method,
        "path": path,
        "status": status
    }));

    match level {
        LogLevel::Error => tracing::error!(target: "custody::api", "{}", event.to_json()),
        LogLevel::Warn => tracing::warn!(target: "custody::api", "{}", event.to_json()),
        _ => tracing::info!(target: "custody::api", "{}", event.to_json()),
    }
}

/// Log a deposit lifecycle event (detected, confirming, credited, failed)
pub fn log_deposit_event(
    event_type: &str,
    deposit_id: &str,
    address_id: &str,
    amount: u128,
    confirmations: u32,
    error: Option<&str>,
) {
    let success = error.is_none();
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Deposit, event_type)
        .with_correlation_id(deposit_id)
        .with_data(serde_json::json!({
            "deposit_id": deposit_id,
            "address_id": address_id,
            "amount": amount.to_string(),
            "confirmations": confirmations,
        }));

    if let Some(err) = error {
        event = event.with_error("DEPOSIT_ERROR", err);
    }

    if success {
        tracing::info!(target: "custody::deposit", "{}", event.to_json());
    } else {
        tracing::warn!(target: "custody::deposit", "{}", event.to_json());
    }
}

/// Log one sweep result
pub fn log_sweep_event(batch_id: &str, result: &SweepResult) {
    let level = match result.status {
        SweepStatus::Success => LogLevel::Info,
        SweepStatus::NeedGas => LogLevel::Warn,
        SweepStatus::Error => LogLevel::Error,
    };

    let mut event = LogEvent::new(level, EventCategory::Sweep, format!("sweep {}", result.status))
        .with_correlation_id(batch_id)
        .with_data(serde_json::json!({
            "address_id": result.address_id,
            "address": result.address,
            "network_id": result.network_id,
            "tx_hash": result.tx_hash,
            "required_gas": result.required_gas.map(|g| g.to_string()),
        }));

    if result.status != SweepStatus::Success {
        event = event.with_error("SWEEP_FAILED", result.message.clone());
    }

    match level {
        LogLevel::Error => tracing::error!(target: "custody::sweep", "{}", event.to_json()),
        LogLevel::Warn => tracing::warn!(target: "custody::sweep", "{}", event.to_json()),
        _ => tracing::info!(target: "custody::sweep", "{}", event.to_json()),
    }
}

/// Raise an operational alert
pub fn log_alert(alert_type: &str, message: &str, details: serde_json::Value) {
    let event = LogEvent::new(LogLevel::Error, EventCategory::Alert, alert_type)
        .with_data(details)
        .with_error("ALERT", message);

    tracing::error!(target: "custody::alert", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// `json_format` selects one JSON object per line (production) over the
/// pretty printer.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let lvl = level.as_filter();
        EnvFilter::new(format!("custody={lvl},tower_http={lvl},axum={lvl}"))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from CustodyConfig
pub fn init_from_config(config: &super::config::CustodyConfig) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    let json_format = config.deployment == super::config::Deployment::Mainnet;

    init_logging(level, json_format)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for request and batch tracing
pub fn generate_correlation_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis() as u64;
    format!("{:x}-{:04x}", millis & 0xFFFF_FFFF, rand::random::<u16>())
}
