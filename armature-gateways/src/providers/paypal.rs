//! PayPal payment provider implementation

use crate::{
    config::GatewaysConfig,
    error::{PaymentError, PaymentResult},
    money::{format_amount, normalize_currency, parse_amount},
    provider::{PaymentProvider, ProviderClient, id_string, unmapped_status},
    types::{PaymentGateway, PaymentIntentRequest, PaymentIntentResponse, PaymentStatus},
    webhook::{WebhookEvent, WebhookRequest, missing_fields},
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path the payer returns to after approving
pub const RETURN_PATH: &str = "/checkout/paypal/return";

/// Path the payer returns to after cancelling
pub const CANCEL_PATH: &str = "/checkout/paypal/cancel";

/// Webhook event types carrying an order resource
const ORDER_EVENTS: &[&str] = &["CHECKOUT.ORDER.APPROVED", "CHECKOUT.ORDER.COMPLETED"];

/// Webhook event types carrying a capture or refund resource
const CAPTURE_EVENTS: &[&str] = &[
    "PAYMENT.CAPTURE.COMPLETED",
    "PAYMENT.CAPTURE.PENDING",
    "PAYMENT.CAPTURE.DENIED",
    "PAYMENT.CAPTURE.REFUNDED",
    "PAYMENT.CAPTURE.REVERSED",
];

const REFUND_EVENT: &str = "PAYMENT.CAPTURE.REFUNDED";

/// Headers forwarded to the signature verification API
const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-transmission-id",
    "paypal-transmission-sig",
    "paypal-transmission-time",
    "paypal-cert-url",
    "paypal-auth-algo",
];

/// PayPal provider
pub struct PayPalProvider {
    config: Arc<GatewaysConfig>,
    client: ProviderClient,
}

impl PayPalProvider {
    /// Create a new PayPal provider
    pub fn new(config: Arc<GatewaysConfig>) -> Self {
        let client = ProviderClient::new(
            PaymentGateway::PayPal,
            config.paypal.base_url(),
            config.timeout(),
        );
        Self { config, client }
    }

    /// Fetch an access token; a fresh one is requested for every API call
    async fn get_token(&self) -> PaymentResult<String> {
        let client_id = self.config.paypal.client_id.require()?;
        let client_secret = self.config.paypal.client_secret.require()?;
        let credentials = STANDARD.encode(format!(
            "{}:{}",
            client_id,
            client_secret.expose_secret()
        ));

        let response = self
            .client
            .send(
                "oauth2/token",
                self.client
                    .http()
                    .post(self.client.url("/v1/oauth2/token"))
                    .header("Authorization", format!("Basic {}", credentials))
                    .form(&[("grant_type", "client_credentials")]),
            )
            .await?;

        let token: PayPalTokenResponse = self
            .client
            .read_json("oauth2/token", response, paypal_error_message)
            .await?;

        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.client.missing_in_response("oauth2/token", "access_token"))
    }

    /// Ask PayPal whether the delivery is authentic
    async fn verify_webhook(
        &self,
        webhook_id: &str,
        request: &WebhookRequest,
        event: &Value,
    ) -> PaymentResult<()> {
        let mut headers = Vec::with_capacity(TRANSMISSION_HEADERS.len());
        for name in TRANSMISSION_HEADERS {
            match request.header_value(name).filter(|v| !v.is_empty()) {
                Some(value) => headers.push(value.to_string()),
                None => {
                    warn!(gateway = "paypal", header = name, "Webhook is missing a transmission header");
                    return Err(PaymentError::InvalidWebhookSignature);
                }
            }
        }
        let [transmission_id, transmission_sig, transmission_time, cert_url, auth_algo]: [String; 5] =
            headers
                .try_into()
                .map_err(|_| PaymentError::InvalidWebhookSignature)?;

        let verification = PayPalVerifyRequest {
            auth_algo,
            cert_url,
            transmission_id,
            transmission_sig,
            transmission_time,
            webhook_id: webhook_id.to_string(),
            webhook_event: event.clone(),
        };

        let token = self.get_token().await?;
        let response = self
            .client
            .send(
                "notifications/verify-webhook-signature",
                self.client
                    .http()
                    .post(self.client.url("/v1/notifications/verify-webhook-signature"))
                    .bearer_auth(token)
                    .json(&verification),
            )
            .await?;

        let verified: PayPalVerifyResponse = self
            .client
            .read_json(
                "notifications/verify-webhook-signature",
                response,
                paypal_error_message,
            )
            .await?;

        if verified.verification_status.as_deref() != Some("SUCCESS") {
            warn!(
                gateway = "paypal",
                verification_status = ?verified.verification_status,
                "Webhook signature verification failed"
            );
            return Err(PaymentError::InvalidWebhookSignature);
        }
        Ok(())
    }

    fn parse_order_event(&self, event: &mut WebhookEvent, resource: &Value) {
        let unit = resource.pointer("/purchase_units/0");
        let raw_status = resource
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();

        event.status = self.map_status(raw_status);
        event.gateway_payment_intent_id = id_string(resource.get("id"));
        event.gateway_transaction_id =
            id_string(resource.pointer("/purchase_units/0/payments/captures/0/id"));
        if let Some(unit) = unit {
            apply_amount(event, unit.get("amount"));
            apply_custom_id(event, unit.get("custom_id"), unit.get("reference_id"));
        }
    }

    /// Returns the refund id when the resource is a refund
    fn parse_capture_event(&self, event: &mut WebhookEvent, resource: &Value) -> Option<String> {
        let raw_status = resource
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();

        event.status = match event.event_type.as_str() {
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => PaymentStatus::Refunded,
            _ if !raw_status.is_empty() => self.map_status(raw_status),
            other => self.map_status(other.rsplit('.').next().unwrap_or_default()),
        };
        event.gateway_payment_intent_id =
            id_string(resource.pointer("/supplementary_data/related_ids/order_id"));
        apply_amount(event, resource.get("amount"));
        apply_custom_id(event, resource.get("custom_id"), None);

        if event.event_type == REFUND_EVENT {
            // The resource is the refund; the capture is its `up` link
            event.gateway_transaction_id = captured_by(resource);
            id_string(resource.get("id"))
        } else {
            event.gateway_transaction_id = id_string(resource.get("id"));
            None
        }
    }

    /// Check required fields and build the event, without authenticating it
    fn parse_event(&self, body: &Value) -> PaymentResult<WebhookEvent> {
        let event_id = id_string(body.get("id"));
        let event_type = body
            .get("event_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let resource = body.get("resource").filter(|r| r.is_object());
        let resource_id = resource.and_then(|r| id_string(r.get("id")));

        let missing = missing_fields([
            ("id", event_id.as_deref()),
            ("event_type", event_type.as_deref()),
            ("resource.id", resource_id.as_deref()),
        ]);
        if !missing.is_empty() {
            return Err(PaymentError::MissingFields(missing));
        }
        let event_type = event_type.unwrap_or_default();
        let Some(resource) = resource else {
            return Err(PaymentError::MissingFields(vec!["resource"]));
        };

        let is_order = ORDER_EVENTS.contains(&event_type.as_str());
        if !is_order && !CAPTURE_EVENTS.contains(&event_type.as_str()) {
            debug!(gateway = "paypal", event_type = %event_type, "Ignoring webhook event type");
            return Err(PaymentError::UnhandledEventType(event_type));
        }

        let mut event = WebhookEvent::new(
            PaymentGateway::PayPal,
            event_id.unwrap_or_default(),
            event_type,
            PaymentStatus::Pending,
        );
        let refund_id = if is_order {
            self.parse_order_event(&mut event, resource);
            None
        } else {
            self.parse_capture_event(&mut event, resource)
        };
        event.metadata = json!({
            "resource_type": body.get("resource_type"),
            "summary": body.get("summary"),
            "refund_id": refund_id,
            "resource": resource,
        });
        Ok(event)
    }
}

/// Capture id from a refund's `up` link (`.../v2/payments/captures/{id}`)
fn captured_by(refund: &Value) -> Option<String> {
    refund
        .get("links")?
        .as_array()?
        .iter()
        .filter(|l| l.get("rel").and_then(Value::as_str) == Some("up"))
        .filter_map(|l| l.get("href").and_then(Value::as_str))
        .find_map(|href| href.trim_end_matches('/').rsplit_once("/captures/"))
        .map(|(_, id)| id.to_string())
        .filter(|id| !id.is_empty())
}

/// Read `{currency_code, value}`
fn apply_amount(event: &mut WebhookEvent, amount: Option<&Value>) {
    if let Some(amount) = amount {
        event.amount = parse_amount(amount.get("value"));
        event.currency = amount
            .get("currency_code")
            .and_then(Value::as_str)
            .map(normalize_currency)
            .unwrap_or_default();
    }
}

/// Read `"{organization_id}|{reference}"`, falling back to the unit's `reference_id`
fn apply_custom_id(event: &mut WebhookEvent, custom_id: Option<&Value>, reference_id: Option<&Value>) {
    let custom_id = custom_id.and_then(Value::as_str).unwrap_or_default();
    let (organization, reference) = match custom_id.split_once('|') {
        Some((org, reference)) => (Some(org), Some(reference)),
        None => (None, None),
    };

    event.organization_id = organization
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string);
    event.set_reference(
        reference
            .filter(|r| !r.trim().is_empty())
            .or_else(|| reference_id.and_then(Value::as_str)),
    );
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn gateway(&self) -> PaymentGateway {
        PaymentGateway::PayPal
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> PaymentResult<PaymentIntentResponse> {
        request.validate()?;
        let return_url = self.config.callback_url(RETURN_PATH)?;
        let cancel_url = self.config.callback_url(CANCEL_PATH)?;
        let token = self.get_token().await?;
        let reference = request.reference();

        let order_request = PayPalOrderRequest {
            intent: "CAPTURE".to_string(),
            purchase_units: vec![PayPalPurchaseUnit {
                reference_id: reference.clone(),
                custom_id: format!("{}|{}", request.organization_id, reference),
                description: request.subject(&reference),
                amount: PayPalAmount {
                    currency_code: request.currency.clone(),
                    value: format_amount(request.amount, &request.currency),
                },
            }],
            application_context: PayPalApplicationContext {
                return_url,
                cancel_url,
                user_action: "PAY_NOW".to_string(),
            },
        };

        let response = self
            .client
            .send(
                "checkout/orders",
                self.client
                    .http()
                    .post(self.client.url("/v2/checkout/orders"))
                    .bearer_auth(token)
                    .json(&order_request),
            )
            .await?;

        let order: PayPalOrder = self
            .client
            .read_json("checkout/orders", response, paypal_error_message)
            .await?;

        let order_id = order
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| self.client.missing_in_response("checkout/orders", "id"))?;
        let approval_url = order
            .links
            .iter()
            .find(|l| l.rel == "approve")
            .or_else(|| order.links.iter().find(|l| l.rel == "payer-action"))
            .map(|l| l.href.clone())
            .ok_or_else(|| self.client.missing_in_response("checkout/orders", "links.approve"))?;
        let status = order
            .status
            .as_deref()
            .map(|s| self.map_status(s))
            .unwrap_or(PaymentStatus::Pending);

        info!(
            gateway = "paypal",
            intent_id = %order_id,
            reference = %reference,
            status = %status,
            "Payment intent created"
        );

        Ok(PaymentIntentResponse {
            status,
            approval_url: Some(approval_url),
            client_secret: None,
            gateway_payment_intent_id: order_id,
            reference,
        })
    }

    async fn process_webhook_event(&self, request: &WebhookRequest) -> PaymentResult<WebhookEvent> {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let event = self.parse_event(&body)?;

        let webhook_id = self.config.paypal.webhook_id.require()?;
        self.verify_webhook(webhook_id, request, &body).await?;

        debug!(
            gateway = "paypal",
            event_id = %event.gateway_event_id,
            event_type = %event.event_type,
            status = %event.status,
            "Parsed webhook event"
        );
        Ok(event)
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        match provider_status.trim().to_uppercase().as_str() {
            "COMPLETED" | "APPROVED" => PaymentStatus::Succeeded,
            "CREATED" | "SAVED" | "PAYER_ACTION_REQUIRED" | "PENDING" => PaymentStatus::Pending,
            "VOIDED" | "DENIED" | "DECLINED" | "FAILED" => PaymentStatus::Failed,
            "REFUNDED" | "PARTIALLY_REFUNDED" | "REVERSED" => PaymentStatus::Refunded,
            other => unmapped_status(PaymentGateway::PayPal, other),
        }
    }
}

fn paypal_error_message(body: &Value) -> Option<String> {
    let message = body
        .get("message")
        .or_else(|| body.get("error_description"))
        .and_then(Value::as_str)?;
    match body.pointer("/details/0/issue").and_then(Value::as_str) {
        Some(issue) => Some(format!("{} ({})", message, issue)),
        None => Some(message.to_string()),
    }
}

// PayPal API types

#[derive(Debug, Deserialize)]
struct PayPalTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct PayPalOrderRequest {
    intent: String,
    purchase_units: Vec<PayPalPurchaseUnit>,
    application_context: PayPalApplicationContext,
}

#[derive(Debug, Serialize)]
struct PayPalPurchaseUnit {
    reference_id: String,
    custom_id: String,
    description: String,
    amount: PayPalAmount,
}

#[derive(Debug, Serialize)]
struct PayPalAmount {
    currency_code: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct PayPalApplicationContext {
    return_url: String,
    cancel_url: String,
    user_action: String,
}

#[derive(Debug, Deserialize)]
struct PayPalOrder {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    links: Vec<PayPalLink>,
}

#[derive(Debug, Deserialize)]
struct PayPalLink {
    href: String,
    rel: String,
}

#[derive(Debug, Serialize)]
struct PayPalVerifyRequest {
    auth_algo: String,
    cert_url: String,
    transmission_id: String,
    transmission_sig: String,
    transmission_time: String,
    webhook_id: String,
    webhook_event: Value,
}

#[derive(Debug, Deserialize)]
struct PayPalVerifyResponse {
    #[serde(default)]
    verification_status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayPalConfig;

    fn provider() -> PayPalProvider {
        let config = GatewaysConfig::new()
            .app_base_url("https://shop.example.com")
            .paypal(
                PayPalConfig::new()
                    .credentials("client", "secret")
                    .api_url("http://127.0.0.1:9"),
            );
        PayPalProvider::new(Arc::new(config))
    }

    #[test]
    fn test_status_mapping() {
        let p = provider();
        assert_eq!(p.map_status("COMPLETED"), PaymentStatus::Succeeded);
        assert_eq!(p.map_status("approved"), PaymentStatus::Succeeded);
        assert_eq!(p.map_status("PAYER_ACTION_REQUIRED"), PaymentStatus::Pending);
        assert_eq!(p.map_status("DECLINED"), PaymentStatus::Failed);
        assert_eq!(p.map_status("PARTIALLY_REFUNDED"), PaymentStatus::Refunded);
        assert_eq!(p.map_status(""), PaymentStatus::Pending);
        assert_eq!(p.map_status("SOMETHING_NEW"), PaymentStatus::Pending);
    }

    #[test]
    fn test_order_approved_event() {
        let p = provider();
        let body = json!({
            "id": "WH-1",
            "event_type": "CHECKOUT.ORDER.APPROVED",
            "resource_type": "checkout-order",
            "resource": {
                "id": "5O190127TN364715T",
                "status": "APPROVED",
                "purchase_units": [{
                    "reference_id": "ord_1",
                    "custom_id": "org1|ord_1",
                    "amount": {"currency_code": "USD", "value": "29.90"}
                }]
            }
        });

        let event = p.parse_event(&body).unwrap();
        assert_eq!(event.gateway_event_id, "WH-1");
        assert_eq!(event.status, PaymentStatus::Succeeded);
        assert_eq!(event.gateway_payment_intent_id.as_deref(), Some("5O190127TN364715T"));
        assert_eq!(event.gateway_transaction_id, None);
        assert_eq!(event.amount.to_string(), "29.90");
        assert_eq!(event.currency, "USD");
        assert_eq!(event.organization_id.as_deref(), Some("org1"));
        assert_eq!(event.order_id.as_deref(), Some("ord_1"));
        assert_eq!(event.reference.as_deref(), Some("ord_1"));
    }

    #[test]
    fn test_capture_refunded_event_forces_refunded() {
        let p = provider();
        let body = json!({
            "id": "WH-2",
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {
                "id": "REFUND-1",
                "status": "COMPLETED",
                "custom_id": "org1|direct-abc",
                "amount": {"currency_code": "USD", "value": "10.00"},
                "links": [
                    {"rel": "self", "href": "https://api.paypal.com/v2/payments/refunds/REFUND-1"},
                    {"rel": "up", "href": "https://api.paypal.com/v2/payments/captures/CAPTURE-1"}
                ]
            }
        });

        let event = p.parse_event(&body).unwrap();
        assert_eq!(event.status, PaymentStatus::Refunded);
        assert_eq!(event.order_id, None);
        assert_eq!(event.reference.as_deref(), Some("direct-abc"));
        assert_eq!(event.organization_id.as_deref(), Some("org1"));
        assert_eq!(event.gateway_transaction_id.as_deref(), Some("CAPTURE-1"));
        assert_eq!(event.metadata["refund_id"], "REFUND-1");
    }

    #[test]
    fn test_refund_without_up_link_has_no_transaction_id() {
        let p = provider();
        let body = json!({
            "id": "WH-5",
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {"id": "REFUND-2", "status": "COMPLETED"}
        });

        let event = p.parse_event(&body).unwrap();
        assert_eq!(event.gateway_transaction_id, None);
        assert_eq!(event.metadata["refund_id"], "REFUND-2");
    }

    #[test]
    fn test_reversed_capture_keeps_capture_id() {
        let p = provider();
        let body = json!({
            "id": "WH-6",
            "event_type": "PAYMENT.CAPTURE.REVERSED",
            "resource": {"id": "CAPTURE-1", "status": "REVERSED"}
        });

        let event = p.parse_event(&body).unwrap();
        assert_eq!(event.status, PaymentStatus::Refunded);
        assert_eq!(event.gateway_transaction_id.as_deref(), Some("CAPTURE-1"));
        assert!(event.metadata["refund_id"].is_null());
    }

    #[tokio::test]
    async fn test_unsigned_event_without_webhook_id_is_rejected() {
        let p = provider();
        let body = json!({
            "id": "WH-FORGED",
            "event_type": "CHECKOUT.ORDER.APPROVED",
            "resource": {"id": "ORDER-1", "status": "APPROVED"}
        });

        let err = p
            .process_webhook_event(&WebhookRequest::post(body.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Config(_)));
        assert!(err.to_string().contains("PAYPAL_WEBHOOK_ID"));
    }

    #[tokio::test]
    async fn test_unhandled_event_type() {
        let p = provider();
        let body = json!({
            "id": "WH-3",
            "event_type": "BILLING.SUBSCRIPTION.CREATED",
            "resource": {"id": "I-1"}
        });

        let err = p
            .process_webhook_event(&WebhookRequest::post(body.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnhandledEventType(_)));
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let p = provider();
        let err = p
            .process_webhook_event(&WebhookRequest::post(r#"{"event_type":"CHECKOUT.ORDER.APPROVED"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing required field(s): id, resource.id");
    }

    #[tokio::test]
    async fn test_missing_transmission_headers_fail_verification() {
        let config = GatewaysConfig::new().paypal(
            PayPalConfig::new()
                .credentials("client", "secret")
                .webhook_id("WH-ID")
                .api_url("http://127.0.0.1:9"),
        );
        let p = PayPalProvider::new(Arc::new(config));
        let body = json!({
            "id": "WH-4",
            "event_type": "CHECKOUT.ORDER.APPROVED",
            "resource": {"id": "ORDER-1", "status": "APPROVED"}
        });

        let err = p
            .process_webhook_event(&WebhookRequest::post(body.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidWebhookSignature));
    }

    #[test]
    fn test_error_message_includes_issue() {
        let body = json!({
            "name": "UNPROCESSABLE_ENTITY",
            "message": "The requested action could not be performed.",
            "details": [{"issue": "CURRENCY_NOT_SUPPORTED"}]
        });
        assert_eq!(
            paypal_error_message(&body).unwrap(),
            "The requested action could not be performed. (CURRENCY_NOT_SUPPORTED)"
        );
    }
}
