use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};

// -----------------------------------------------------------------------------
// ----- PoolError -------------------------------------------------------------

/// Every error that crosses the pool boundary.
///
/// `Clone` because one creation result is shared by every caller waiting on
/// the same in-flight creation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("circuit open for tenant '{tenant}', retry in {remaining_secs}s")]
    CircuitOpen { tenant: String, remaining_secs: u64 },

    #[error("rate limit exceeded for '{key}', resets in {}ms", .reset_after.as_millis())]
    RateLimited { key: String, reset_after: Duration },

    #[error("pairing code request failed: {message}")]
    PairingCode { message: String, retryable: bool },

    #[error("no active session for tenant '{tenant}': {message}")]
    Session { tenant: String, message: String },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

// -----------------------------------------------------------------------------
// ----- PoolError: Static -----------------------------------------------------

impl PoolError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        PoolError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn session(tenant: impl ToString, message: impl Into<String>) -> Self {
        PoolError::Session {
            tenant: tenant.to_string(),
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        PoolError::Connection {
            message: message.into(),
        }
    }

    pub fn pairing(message: impl Into<String>, retryable: bool) -> Self {
        PoolError::PairingCode {
            message: message.into(),
            retryable,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        PoolError::Configuration {
            message: message.into(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PoolError: Public -----------------------------------------------------

impl PoolError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Validation { .. } => "VALIDATION_ERROR",
            PoolError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            PoolError::RateLimited { .. } => "RATE_LIMITED",
            PoolError::PairingCode { .. } => "PAIRING_CODE_ERROR",
            PoolError::Session { .. } => "SESSION_ERROR",
            PoolError::Connection { .. } => "CONNECTION_ERROR",
            PoolError::Configuration { .. } => "CONFIGURATION_ERROR",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            PoolError::Validation { .. } | PoolError::Configuration { .. } => false,
            PoolError::PairingCode { retryable, .. } => *retryable,
            PoolError::CircuitOpen { .. }
            | PoolError::RateLimited { .. }
            | PoolError::Session { .. }
            | PoolError::Connection { .. } => true,
        }
    }

    /// Back-off metadata so callers need not poll again.
    pub fn details(&self) -> Value {
        match self {
            PoolError::Validation { field, .. } => json!({ "field": field }),
            PoolError::CircuitOpen {
                tenant,
                remaining_secs,
            } => json!({ "tenant_id": tenant, "retry_after_secs": remaining_secs }),
            PoolError::RateLimited { key, reset_after } => {
                json!({ "key": key, "reset_after_ms": reset_after.as_millis() as u64 })
            }
            PoolError::Session { tenant, .. } => json!({ "tenant_id": tenant }),
            PoolError::PairingCode { .. }
            | PoolError::Connection { .. }
            | PoolError::Configuration { .. } => Value::Null,
        }
    }

    pub fn to_standard(&self) -> StandardError {
        StandardError {
            code: self.code(),
            message: self.to_string(),
            retryable: self.retryable(),
            details: self.details(),
        }
    }

    /// Logs at the severity the error class calls for: configuration is an
    /// error, retryable is a warning, everything else is informational.
    pub fn log(&self, operation: &str) {
        match self {
            PoolError::Configuration { .. } => {
                error!(operation, code = self.code(), "{self}");
            }
            _ if self.retryable() => {
                warn!(operation, code = self.code(), "{self}");
            }
            _ => {
                info!(operation, code = self.code(), "{self}");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- StandardError ---------------------------------------------------------

/// Wire shape of a [`PoolError`] for the REST/webhook layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StandardError {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    pub details: Value,
}

impl From<PoolError> for StandardError {
    fn from(err: PoolError) -> Self {
        err.to_standard()
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
