//! Inbound webhook request and the canonical webhook event

use crate::types::{PaymentGateway, PaymentStatus, order_from_reference};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw inbound webhook exactly as the provider sent it
///
/// The body is kept as unparsed bytes so signatures computed over the raw
/// payload can be checked before anything is deserialized.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// HTTP method (`GET`, `POST`)
    pub method: String,
    /// Headers, keys lowercased
    pub headers: HashMap<String, String>,
    /// Decoded query parameters
    pub query: HashMap<String, String>,
    /// Raw body
    pub body: Vec<u8>,
}

impl WebhookRequest {
    /// A POST request with the given raw body
    pub fn post(body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: "POST".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// A bodyless GET request
    pub fn get() -> Self {
        Self {
            method: "GET".to_string(),
            ..Default::default()
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Add a query parameter
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Parse and merge a raw query string such as `topic=payment&id=123`
    pub fn query_string(mut self, raw: &str) -> Self {
        let raw = raw.trim_start_matches('?');
        for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
            self.query.insert(k.into_owned(), v.into_owned());
        }
        self
    }

    /// Get a header (case-insensitive)
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Get a non-empty query parameter
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Decode the body as `application/x-www-form-urlencoded`
    pub fn form_fields(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(&self.body)
            .into_owned()
            .collect()
    }
}

/// Canonical webhook event every adapter produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Gateway that produced the event
    pub gateway: PaymentGateway,
    /// Provider id of this notification, the idempotency key
    pub gateway_event_id: String,
    /// Provider event/topic name, verbatim
    pub event_type: String,
    /// Mapped status
    pub status: PaymentStatus,
    /// Provider transaction id
    pub gateway_transaction_id: Option<String>,
    /// Provider order/preference/invoice id
    pub gateway_payment_intent_id: Option<String>,
    /// Amount reported by the provider, zero when omitted
    pub amount: Decimal,
    /// Uppercase currency code, empty when omitted
    pub currency: String,
    /// Reference the provider echoed back: the order id or a direct reference
    pub reference: Option<String>,
    /// Caller's order reference
    pub order_id: Option<String>,
    /// Owning tenant, when the provider can carry it
    pub organization_id: Option<String>,
    /// Raw and derived payload
    pub metadata: serde_json::Value,
    /// When the webhook was parsed
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Create an event with optional data left empty
    pub fn new(
        gateway: PaymentGateway,
        gateway_event_id: impl Into<String>,
        event_type: impl Into<String>,
        status: PaymentStatus,
    ) -> Self {
        Self {
            gateway,
            gateway_event_id: gateway_event_id.into(),
            event_type: event_type.into(),
            status,
            gateway_transaction_id: None,
            gateway_payment_intent_id: None,
            amount: Decimal::ZERO,
            currency: String::new(),
            reference: None,
            order_id: None,
            organization_id: None,
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    /// Is a successful payment event
    pub fn is_success(&self) -> bool {
        self.status == PaymentStatus::Succeeded
    }

    /// Set the echoed reference and the order it names, if any
    pub fn set_reference(&mut self, reference: Option<&str>) {
        self.reference = reference
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        self.order_id = order_from_reference(self.reference.as_deref());
    }
}

/// Collect the names of required fields that are absent or empty
pub(crate) fn missing_fields<'a>(
    fields: impl IntoIterator<Item = (&'static str, Option<&'a str>)>,
) -> Vec<&'static str> {
    fields
        .into_iter()
        .filter(|(_, v)| v.map(|v| v.trim().is_empty()).unwrap_or(true))
        .map(|(name, _)| name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = WebhookRequest::post("{}").header("X-NowPayments-Sig", "abc");
        assert_eq!(request.header_value("x-nowpayments-sig"), Some("abc"));
        assert_eq!(request.header_value("X-NOWPAYMENTS-SIG"), Some("abc"));
    }

    #[test]
    fn test_direct_reference_names_no_order() {
        let mut event = WebhookEvent::new(PaymentGateway::Flow, "e1", "t", PaymentStatus::Pending);
        event.set_reference(Some(" direct-abc "));
        assert_eq!(event.reference.as_deref(), Some("direct-abc"));
        assert_eq!(event.order_id, None);

        event.set_reference(Some("ord_1"));
        assert_eq!(event.order_id.as_deref(), Some("ord_1"));
    }

    #[test]
    fn test_query_string_parsing() {
        let request = WebhookRequest::get().query_string("?topic=payment&data.id=42&empty=");
        assert_eq!(request.query_value("topic"), Some("payment"));
        assert_eq!(request.query_value("data.id"), Some("42"));
        assert_eq!(request.query_value("empty"), None);
    }

    #[test]
    fn test_form_fields() {
        let request = WebhookRequest::post("token=abc&status=2&subject=Order+%231");
        let fields = request.form_fields();
        assert_eq!(fields.get("token").map(String::as_str), Some("abc"));
        assert_eq!(fields.get("subject").map(String::as_str), Some("Order #1"));
    }

    #[test]
    fn test_missing_fields() {
        let missing = missing_fields([("token", Some("abc")), ("status", Some(" ")), ("s", None)]);
        assert_eq!(missing, vec!["status", "s"]);
    }
}
