//! Error types for FlexGate notification operations.
//!
//! This module provides a single error hierarchy with structured error codes
//! so callers of the management surface can react programmatically.

use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for notification operations.
pub type FlexGateResult<T> = Result<T, FlexGateError>;

/// Main error type for the notification core.
#[derive(Error, Debug)]
pub enum FlexGateError {
    /// Input validation failed.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        code: ErrorCode,
        details: HashMap<String, String>,
    },

    /// Webhook registration not found.
    #[error("Not found: {message}")]
    NotFound {
        message: String,
        code: ErrorCode,
        webhook_id: Option<String>,
    },

    /// A single HTTP delivery attempt failed.
    #[error("Delivery error: {message}")]
    Delivery {
        message: String,
        code: ErrorCode,
        status_code: Option<u16>,
    },

    /// Durable store operation failed.
    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation (VAL_xxx)
    ValInvalidUrl,
    ValInsecureUrl,
    ValMissingField,
    ValInvalidRetryPolicy,
    ValDuplicateId,
    ValInvalidHeader,

    // Webhooks (WH_xxx)
    WebhookNotFound,

    // Delivery (DLV_xxx)
    DlvConnectionFailed,
    DlvTimeout,
    DlvHttpStatus,

    // Database (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValInvalidUrl => "VAL_001",
            ErrorCode::ValInsecureUrl => "VAL_002",
            ErrorCode::ValMissingField => "VAL_003",
            ErrorCode::ValInvalidRetryPolicy => "VAL_004",
            ErrorCode::ValDuplicateId => "VAL_005",
            ErrorCode::ValInvalidHeader => "VAL_006",
            ErrorCode::WebhookNotFound => "WH_001",
            ErrorCode::DlvConnectionFailed => "DLV_001",
            ErrorCode::DlvTimeout => "DLV_002",
            ErrorCode::DlvHttpStatus => "DLV_003",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl FlexGateError {
    /// Create a validation error with a specific code.
    pub fn validation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code,
            details: HashMap::new(),
        }
    }

    /// Create a validation error pointing at a single offending field.
    pub fn invalid_field(
        code: ErrorCode,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut details = HashMap::new();
        details.insert("field".to_string(), field.into());
        Self::Validation {
            message: message.into(),
            code,
            details,
        }
    }

    /// Create a not found error for a webhook id.
    pub fn webhook_not_found(webhook_id: impl Into<String>) -> Self {
        let id = webhook_id.into();
        Self::NotFound {
            message: format!("Webhook with id '{}' not found", id),
            code: ErrorCode::WebhookNotFound,
            webhook_id: Some(id),
        }
    }

    /// Create a delivery error.
    pub fn delivery(code: ErrorCode, message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Delivery {
            message: message.into(),
            code,
            status_code,
        }
    }

    /// Create a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { code, .. } => *code,
            Self::NotFound { code, .. } => *code,
            Self::Delivery { code, .. } => *code,
            Self::Persistence { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether this error came from the durable store.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

impl From<rusqlite::Error> for FlexGateError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
            code: ErrorCode::DbOperationFailed,
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = FlexGateError::validation(ErrorCode::ValInvalidUrl, "Invalid URL: nope");
        assert_eq!(err.code(), ErrorCode::ValInvalidUrl);
        assert!(err.to_string().contains("Invalid URL"));
    }

    #[test]
    fn test_webhook_not_found() {
        let err = FlexGateError::webhook_not_found("w1");
        assert_eq!(err.code(), ErrorCode::WebhookNotFound);
        assert!(err.to_string().contains("'w1'"));
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::ValInvalidUrl.as_str(), "VAL_001");
        assert_eq!(ErrorCode::WebhookNotFound.as_str(), "WH_001");
        assert_eq!(ErrorCode::DbOperationFailed.as_str(), "DB_002");
    }

    #[test]
    fn test_rusqlite_error_maps_to_persistence() {
        let err: FlexGateError = rusqlite::Error::InvalidQuery.into();
        assert!(err.is_persistence());
        assert_eq!(err.code(), ErrorCode::DbOperationFailed);
    }
}
