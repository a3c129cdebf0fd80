//! Error types for gateway operations

use crate::store::StoreError;
use thiserror::Error;

/// Gateway error types
#[derive(Error, Debug)]
pub enum PaymentError {
    /// A required setting is missing or unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// The provider rejected the request or answered with an unusable body
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// Webhook signature did not match its payload
    #[error("invalid signature")]
    InvalidWebhookSignature,

    /// Webhook is missing identifying fields
    #[error("missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    /// Webhook topic the adapter does not process
    #[error("unhandled event type: {0}")]
    UnhandledEventType(String),

    /// No adapter exists for the requested tag
    #[error("unsupported gateway type: {0}")]
    UnsupportedGateway(String),

    /// Invalid amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl PaymentError {
    /// Build a provider error, prefixed with the provider name on display
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Build a missing-setting error naming the environment variable
    pub fn missing_setting(var: &str) -> Self {
        Self::Config(format!("missing required setting {}", var))
    }

    /// Whether this error means the webhook must not be trusted
    pub fn is_authenticity_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidWebhookSignature | Self::MissingFields(_)
        )
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        PaymentError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        PaymentError::Serialization(err.to_string())
    }
}

/// Result type for gateway operations
pub type PaymentResult<T> = Result<T, PaymentError>;
