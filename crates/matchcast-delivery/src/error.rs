//! Error types for the delivery engine.

use crate::store::StoreError;

/// Delivery engine error variants.
///
/// Transient classes (`Server`, `RateLimited`, `Network`) are retried up to
/// the configured ceiling; permanent classes short-circuit immediately.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Rate limited on {identifier}, resets in {retry_after_ms}ms")]
    RateLimited {
        identifier: String,
        retry_after_ms: i64,
    },

    #[error("Server error: HTTP {status}")]
    Server { status: u16, body: String },

    #[error("Client error: HTTP {status}")]
    Client { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt stored state under {key}")]
    Corruption { key: String },
}

impl DeliveryError {
    /// Whether the error class is safe to retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::RateLimited { .. } | Self::Network(_)
        )
    }

    /// Stable identifier for logging and receipts.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Client { .. } => "client_error",
            Self::Network(_) => "network_error",
            Self::Configuration(_) => "configuration_error",
            Self::Storage(_) => "storage_error",
            Self::Corruption { .. } => "corruption_error",
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network(format!("Request timeout: {e}"))
        } else if e.is_connect() {
            Self::Network(format!("Connection failed: {e}"))
        } else {
            Self::Network(format!("Request error: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classes_are_retryable() {
        assert!(DeliveryError::Server {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(DeliveryError::Network("reset".to_string()).is_retryable());
        assert!(DeliveryError::RateLimited {
            identifier: "x".to_string(),
            retry_after_ms: 100
        }
        .is_retryable());
    }

    #[test]
    fn test_permanent_classes_are_not_retryable() {
        assert!(!DeliveryError::Validation("bad".to_string()).is_retryable());
        assert!(!DeliveryError::Client {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!DeliveryError::Configuration("no url".to_string()).is_retryable());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(
            DeliveryError::Validation("x".to_string()).kind(),
            "validation_error"
        );
        assert_eq!(
            DeliveryError::Corruption {
                key: "k".to_string()
            }
            .kind(),
            "corruption_error"
        );
    }
}
