//! Unified error handling for the sync services
//!
//! One error type shared by the device client, the simulator client, the
//! equipment manager and the configuration loaders. Expected partial failures
//! (a single point rejected inside a batch, a dropped simulator sample) are
//! not errors and never pass through this type.

use thiserror::Error;

// ============================================================================
// SyncError - Main error type
// ============================================================================

/// Main error type for the sync services
#[derive(Debug, Error)]
pub enum SyncError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Device Communication Errors
    // ======================================
    #[error("Authentication failed for {device}: {reason}")]
    Authentication { device: String, reason: String },

    #[error("Transient network error: {endpoint}: {reason}")]
    TransientNetwork { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Protocol error: {endpoint}: status {status}: {message}")]
    Protocol {
        endpoint: String,
        status: u16,
        message: String,
    },

    // ======================================
    // Point & Unit Errors
    // ======================================
    #[error("Point not found: {object_type}:{name}")]
    PointResolution { object_type: String, name: String },

    #[error("Unsupported unit: {0}")]
    UnsupportedUnit(String),

    #[error("Incompatible units: {from} -> {to}")]
    IncompatibleUnits { from: String, to: String },

    // ======================================
    // Simulator Errors
    // ======================================
    #[error("Simulator error: {0}")]
    Simulator(String),

    // ======================================
    // Runtime Errors
    // ======================================
    #[error("Timezone error: {0}")]
    Timezone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Classify a reqwest failure against the endpoint it was sent to
    pub fn from_transport(endpoint: impl Into<String>, err: &reqwest::Error) -> Self {
        let endpoint = endpoint.into();
        if err.is_timeout() {
            Self::Timeout(endpoint)
        } else if err.is_decode() {
            Self::Serialization(format!("{}: {}", endpoint, err))
        } else {
            Self::TransientNetwork {
                endpoint,
                reason: err.to_string(),
            }
        }
    }

    /// Map a non-success HTTP status to the error taxonomy
    ///
    /// 401/403 become authentication errors, 408/429/5xx are transient, every
    /// other status is a protocol error that is not worth retrying.
    pub fn from_status(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        match status {
            401 | 403 => Self::Authentication {
                device: endpoint,
                reason: format!("HTTP {}", status),
            },
            408 | 429 | 500..=599 => Self::TransientNetwork {
                endpoint,
                reason: format!("HTTP {}", status),
            },
            _ => Self::Protocol {
                endpoint,
                status,
                message: body.into(),
            },
        }
    }

    /// True for 401/403 style failures that a fresh session may cure
    pub fn is_auth_expiry(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for SyncError {
    fn from(err: std::num::ParseFloatError) -> Self {
        Self::Serialization(format!("Invalid float: {}", err))
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::SyncError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::SyncError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! invalid_config {
    ($field:expr, $reason:expr) => {
        $crate::SyncError::InvalidConfig {
            field: $field.to_string(),
            reason: $reason.to_string(),
        }
    };
}

// ============================================================================
// SyncError implements ClassifiedError
// ============================================================================

impl ClassifiedError for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Authentication { .. } => "AUTHENTICATION_FAILED",
            Self::TransientNetwork { .. } => "TRANSIENT_NETWORK",
            Self::Timeout(_) => "TIMEOUT",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::PointResolution { .. } => "POINT_NOT_FOUND",
            Self::UnsupportedUnit(_) => "UNSUPPORTED_UNIT",
            Self::IncompatibleUnits { .. } => "INCOMPATIBLE_UNITS",
            Self::Simulator(_) => "SIMULATOR_ERROR",
            Self::Timezone(_) => "TIMEZONE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::InvalidConfig { .. } | Self::Timezone(_) => {
                ErrorCategory::Configuration
            },
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::TransientNetwork { .. } => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::PointResolution { .. } => ErrorCategory::NotFound,
            Self::UnsupportedUnit(_) | Self::IncompatibleUnits { .. } => ErrorCategory::Conversion,
            Self::Simulator(_) => ErrorCategory::External,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Error category enum - used for classification and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Authentication,
    Network,
    Timeout,
    Protocol,
    NotFound,
    Conversion,
    External,
    Internal,
}

/// Classification capability shared by service error types
pub trait ClassifiedError: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Timeout
        )
    }

    /// Whether the failure takes a whole device out of the current cycle
    fn is_device_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Authentication | ErrorCategory::Configuration
        )
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(SyncError::from_status("dev", 401, "").is_auth_expiry());
        assert!(SyncError::from_status("dev", 403, "").is_auth_expiry());
        assert!(SyncError::from_status("dev", 503, "").is_retryable());
        assert!(SyncError::from_status("dev", 429, "").is_retryable());

        let err = SyncError::from_status("dev", 404, "missing");
        assert!(!err.is_retryable());
        assert_eq!(err.error_code(), "PROTOCOL_ERROR");
    }

    #[test]
    fn test_error_retryable() {
        assert!(SyncError::Timeout("dev".into()).is_retryable());
        assert!(!SyncError::UnsupportedUnit("furlong".into()).is_retryable());
        assert!(!SyncError::Authentication {
            device: "dev".into(),
            reason: "bad password".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_config_macros() {
        let err = config_error!("bad file {}", "ahu.json");
        assert_eq!(err.to_string(), "Configuration error: bad file ahu.json");
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err = invalid_config!("threshold", "required for BinaryInput");
        assert!(err.is_device_fatal());
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }
}
