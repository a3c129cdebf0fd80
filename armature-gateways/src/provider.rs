//! Gateway adapter trait and common functionality

use crate::{
    error::{PaymentError, PaymentResult},
    types::{PaymentGateway, PaymentIntentRequest, PaymentIntentResponse, PaymentStatus},
    webhook::{WebhookEvent, WebhookRequest},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{error, warn};

/// Gateway adapter trait
///
/// Implement this trait for each payment provider (Flow, PayPal, etc.)
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Get the gateway tag
    fn gateway(&self) -> PaymentGateway;

    /// Open a checkout with the provider
    ///
    /// Makes one provider call and no retries. A non-success response, or a
    /// success body missing the fields the checkout needs, becomes
    /// [`PaymentError::Provider`] carrying the provider's own message.
    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> PaymentResult<PaymentIntentResponse>;

    /// Authenticate and parse an inbound webhook into the canonical event
    ///
    /// Does not deduplicate; callers gate on `gateway_event_id`.
    async fn process_webhook_event(&self, request: &WebhookRequest) -> PaymentResult<WebhookEvent>;

    /// Map a provider status string; unknown values map to pending
    fn map_status(&self, provider_status: &str) -> PaymentStatus;
}

/// Log and fall back to pending for a status the mapping table lacks
pub(crate) fn unmapped_status(gateway: PaymentGateway, provider_status: &str) -> PaymentStatus {
    warn!(
        gateway = %gateway,
        status = provider_status,
        "Unmapped provider status, defaulting to pending"
    );
    PaymentStatus::Pending
}

/// Common HTTP client for providers
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
    gateway: PaymentGateway,
}

impl ProviderClient {
    /// Create a new provider client with a request timeout
    pub fn new(gateway: PaymentGateway, base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gateway,
        }
    }

    /// Underlying HTTP client
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, logging transport failures
    pub async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> PaymentResult<reqwest::Response> {
        request.send().await.map_err(|e| {
            error!(
                gateway = %self.gateway,
                operation,
                error = %e,
                "Provider request could not be sent"
            );
            PaymentError::from(e)
        })
    }

    /// Decode a success body, or turn a failure into a provider error
    ///
    /// `message_of` extracts the provider's own message from an error body.
    pub async fn read_json<T, F>(
        &self,
        operation: &str,
        response: reqwest::Response,
        message_of: F,
    ) -> PaymentResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&serde_json::Value) -> Option<String>,
    {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!(
                gateway = %self.gateway,
                operation,
                status = status.as_u16(),
                body = %body,
                "Provider request failed"
            );
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| message_of(&v))
                .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body));
            return Err(PaymentError::provider(self.gateway.as_str(), message));
        }

        serde_json::from_str(&body).map_err(|e| {
            error!(
                gateway = %self.gateway,
                operation,
                body = %body,
                error = %e,
                "Provider returned an unreadable body"
            );
            PaymentError::provider(
                self.gateway.as_str(),
                format!("unexpected response body: {}", e),
            )
        })
    }

    /// Fail with a provider error for a success body missing a field
    pub fn missing_in_response(&self, operation: &str, field: &str) -> PaymentError {
        error!(
            gateway = %self.gateway,
            operation,
            field,
            "Provider response is missing a required field"
        );
        PaymentError::provider(
            self.gateway.as_str(),
            format!("response missing required field `{}`", field),
        )
    }
}

/// Read a provider id that may arrive as a JSON string or number
pub(crate) fn id_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_string() {
        assert_eq!(id_string(Some(&json!("abc"))), Some("abc".to_string()));
        assert_eq!(id_string(Some(&json!(5077125051u64))), Some("5077125051".to_string()));
        assert_eq!(id_string(Some(&json!(""))), None);
        assert_eq!(id_string(Some(&json!(null))), None);
        assert_eq!(id_string(None), None);
    }

    #[test]
    fn test_url_joining() {
        let client = ProviderClient::new(
            PaymentGateway::Flow,
            "https://sandbox.flow.cl/api/",
            Duration::from_secs(5),
        );
        assert_eq!(
            client.url("/payment/create"),
            "https://sandbox.flow.cl/api/payment/create"
        );
    }

    #[test]
    fn test_unmapped_status_is_pending() {
        assert_eq!(
            unmapped_status(PaymentGateway::PayPal, "SOMETHING_NEW"),
            PaymentStatus::Pending
        );
    }
}
