//! Flow payment provider implementation
//!
//! Every request is a form POST signed with `s`, the HMAC-SHA256 of the
//! parameters sorted by name and concatenated as `name+value`. Payment
//! confirmations arrive the same way and are re-signed before any field is
//! trusted.

use crate::{
    config::GatewaysConfig,
    error::{PaymentError, PaymentResult},
    money::{format_amount, normalize_currency, parse_amount_str},
    provider::{PaymentProvider, ProviderClient, id_string, unmapped_status},
    signature::{sign_params, verify_hex},
    types::{PaymentGateway, PaymentIntentRequest, PaymentIntentResponse, PaymentStatus},
    webhook::{WebhookEvent, WebhookRequest, missing_fields},
};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path Flow posts confirmations to, under the application base URL
pub const CONFIRMATION_PATH: &str = "/webhooks/flow";

/// Path the payer returns to after paying
pub const RETURN_PATH: &str = "/checkout/flow/return";

const SIGNATURE_FIELD: &str = "s";

/// Flow provider
pub struct FlowProvider {
    config: Arc<GatewaysConfig>,
    client: ProviderClient,
}

impl FlowProvider {
    /// Create a new Flow provider
    pub fn new(config: Arc<GatewaysConfig>) -> Self {
        let client = ProviderClient::new(
            PaymentGateway::Flow,
            config.flow.base_url(),
            config.timeout(),
        );
        Self { config, client }
    }

    /// Sign a parameter set with the secret key
    pub fn sign<'a, I>(&self, params: I) -> PaymentResult<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let secret = self.config.flow.secret_key.require()?;
        Ok(sign_params(
            secret.expose_secret().as_bytes(),
            params,
            SIGNATURE_FIELD,
        ))
    }
}

#[async_trait]
impl PaymentProvider for FlowProvider {
    fn gateway(&self) -> PaymentGateway {
        PaymentGateway::Flow
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> PaymentResult<PaymentIntentResponse> {
        request.validate()?;
        let api_key = self.config.flow.api_key.require()?;
        let confirmation_url = self.config.callback_url(CONFIRMATION_PATH)?;
        let return_url = self.config.callback_url(RETURN_PATH)?;

        let reference = request.reference();
        let optional = json!({
            "organization_id": request.organization_id,
            "user_id": request.user_id,
            "order_id": request.order_id,
        })
        .to_string();

        let mut params: Vec<(&str, String)> = vec![
            ("apiKey", api_key.expose_secret().to_string()),
            ("commerceOrder", reference.clone()),
            ("subject", request.subject(&reference)),
            ("currency", request.currency.clone()),
            ("amount", format_amount(request.amount, &request.currency)),
            ("urlConfirmation", confirmation_url),
            ("urlReturn", return_url),
            ("optional", optional),
        ];
        if let Some(email) = &request.payer_email {
            params.push(("email", email.clone()));
        }
        let signature = self.sign(params.iter().map(|(k, v)| (*k, v.as_str())))?;
        params.push((SIGNATURE_FIELD, signature));

        let response = self
            .client
            .send(
                "payment/create",
                self.client
                    .http()
                    .post(self.client.url("/payment/create"))
                    .form(&params),
            )
            .await?;

        let created: FlowCreateResponse = self
            .client
            .read_json("payment/create", response, flow_error_message)
            .await?;

        let token = created
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.client.missing_in_response("payment/create", "token"))?;
        let url = created
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| self.client.missing_in_response("payment/create", "url"))?;

        info!(
            gateway = "flow",
            intent_id = %token,
            reference = %reference,
            flow_order = ?id_string(created.flow_order.as_ref()),
            "Payment intent created"
        );

        Ok(PaymentIntentResponse {
            status: PaymentStatus::Pending,
            approval_url: Some(format!("{}?token={}", url, token)),
            client_secret: None,
            gateway_payment_intent_id: token,
            reference,
        })
    }

    async fn process_webhook_event(&self, request: &WebhookRequest) -> PaymentResult<WebhookEvent> {
        let fields = request.form_fields();
        let field = |name: &str| fields.get(name).map(String::as_str);

        let missing = missing_fields([
            ("token", field("token")),
            ("status", field("status")),
            (SIGNATURE_FIELD, field(SIGNATURE_FIELD)),
        ]);
        if !missing.is_empty() {
            return Err(PaymentError::MissingFields(missing));
        }

        let provided = field(SIGNATURE_FIELD).unwrap_or_default();
        let expected = self.sign(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        if !verify_hex(&expected, provided) {
            warn!(gateway = "flow", token = ?field("token"), "Rejected confirmation with invalid signature");
            return Err(PaymentError::InvalidWebhookSignature);
        }

        let token = field("token").unwrap_or_default().to_string();
        let raw_status = field("status").unwrap_or_default().to_string();
        let optional: HashMap<String, serde_json::Value> = field("optional")
            .and_then(|o| serde_json::from_str(o).ok())
            .unwrap_or_default();
        let optional_str = |key: &str| {
            optional
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let mut event = WebhookEvent::new(
            PaymentGateway::Flow,
            format!("{}:{}", token, raw_status),
            "payment_confirmation",
            self.map_status(&raw_status),
        );
        event.gateway_transaction_id = field("flowOrder")
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        event.gateway_payment_intent_id = Some(token);
        event.amount = field("amount").map(parse_amount_str).unwrap_or_default();
        event.currency = field("currency").map(normalize_currency).unwrap_or_default();
        event.set_reference(field("commerceOrder"));
        if event.order_id.is_none() {
            event.order_id = optional_str("order_id");
        }
        event.organization_id = optional_str("organization_id");

        let metadata: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .filter(|(k, _)| k.as_str() != SIGNATURE_FIELD)
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        event.metadata = serde_json::Value::Object(metadata);

        debug!(
            gateway = "flow",
            event_id = %event.gateway_event_id,
            status = %event.status,
            "Parsed payment confirmation"
        );
        Ok(event)
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        match provider_status.trim().to_lowercase().as_str() {
            "1" | "pending" | "pendiente" => PaymentStatus::Pending,
            "2" | "paid" | "pagada" | "pagado" => PaymentStatus::Succeeded,
            "3" | "rejected" | "rechazada" | "rechazado" => PaymentStatus::Failed,
            "4" | "canceled" | "cancelled" | "anulada" | "anulado" => PaymentStatus::Failed,
            "refunded" | "reembolsada" | "reembolsado" => PaymentStatus::Refunded,
            other => unmapped_status(PaymentGateway::Flow, other),
        }
    }
}

fn flow_error_message(body: &serde_json::Value) -> Option<String> {
    let message = body.get("message")?.as_str()?;
    match id_string(body.get("code")) {
        Some(code) => Some(format!("{} (code {})", message, code)),
        None => Some(message.to_string()),
    }
}

// Flow API types

#[derive(Debug, Deserialize)]
struct FlowCreateResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "flowOrder")]
    flow_order: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;

    fn provider() -> FlowProvider {
        let config = GatewaysConfig::new()
            .app_base_url("https://shop.example.com")
            .flow(FlowConfig::new().credentials("api-key", "secret-key"));
        FlowProvider::new(Arc::new(config))
    }

    fn signed_body(provider: &FlowProvider, fields: &[(&str, &str)]) -> String {
        let s = provider.sign(fields.iter().copied()).unwrap();
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(fields.iter().copied());
        serializer.append_pair("s", &s);
        serializer.finish()
    }

    #[test]
    fn test_status_mapping() {
        let p = provider();
        assert_eq!(p.map_status("2"), PaymentStatus::Succeeded);
        assert_eq!(p.map_status("paid"), PaymentStatus::Succeeded);
        assert_eq!(p.map_status("Pagada"), PaymentStatus::Succeeded);
        assert_eq!(p.map_status("1"), PaymentStatus::Pending);
        assert_eq!(p.map_status("3"), PaymentStatus::Failed);
        assert_eq!(p.map_status("anulada"), PaymentStatus::Failed);
        assert_eq!(p.map_status("refunded"), PaymentStatus::Refunded);
        assert_eq!(p.map_status(""), PaymentStatus::Pending);
        assert_eq!(p.map_status("9"), PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_signed_confirmation() {
        let p = provider();
        let optional = r#"{"organization_id":"org1","user_id":"u1","order_id":"ord_1"}"#;
        let body = signed_body(
            &p,
            &[
                ("token", "tok_1"),
                ("status", "paid"),
                ("flowOrder", "8765"),
                ("commerceOrder", "ord_1"),
                ("amount", "19990"),
                ("currency", "clp"),
                ("optional", optional),
            ],
        );

        let event = p
            .process_webhook_event(&WebhookRequest::post(body))
            .await
            .unwrap();
        assert_eq!(event.status, PaymentStatus::Succeeded);
        assert_eq!(event.gateway_event_id, "tok_1:paid");
        assert_eq!(event.gateway_payment_intent_id.as_deref(), Some("tok_1"));
        assert_eq!(event.gateway_transaction_id.as_deref(), Some("8765"));
        assert_eq!(event.amount, rust_decimal::Decimal::from(19990));
        assert_eq!(event.currency, "CLP");
        assert_eq!(event.order_id.as_deref(), Some("ord_1"));
        assert_eq!(event.organization_id.as_deref(), Some("org1"));
        assert!(event.metadata.get("s").is_none());
    }

    #[tokio::test]
    async fn test_tampered_amount_is_rejected() {
        let p = provider();
        let body = signed_body(&p, &[("token", "tok_1"), ("status", "2"), ("amount", "19990")]);
        let tampered = body.replace("amount=19990", "amount=1");

        let err = p
            .process_webhook_event(&WebhookRequest::post(tampered))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidWebhookSignature));
    }

    #[tokio::test]
    async fn test_tampered_signature_is_rejected() {
        let p = provider();
        let body = "token=tok_1&status=2&s=deadbeef";

        let err = p
            .process_webhook_event(&WebhookRequest::post(body))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid signature");
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let p = provider();
        let body = signed_body(&p, &[("status", "2"), ("amount", "100")]);

        let err = p
            .process_webhook_event(&WebhookRequest::post(body))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::MissingFields(ref f) if f == &vec!["token"]));
    }

    #[tokio::test]
    async fn test_missing_secret_is_a_config_error() {
        let p = FlowProvider::new(Arc::new(GatewaysConfig::new()));
        let err = p
            .process_webhook_event(&WebhookRequest::post("token=t&status=2&s=abc"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("FLOW_SECRET_KEY"));
    }

    #[tokio::test]
    async fn test_direct_payment_has_no_order() {
        let p = provider();
        let body = signed_body(
            &p,
            &[("token", "tok_2"), ("status", "1"), ("commerceOrder", "direct-abc123")],
        );
        let event = p
            .process_webhook_event(&WebhookRequest::post(body))
            .await
            .unwrap();
        assert_eq!(event.status, PaymentStatus::Pending);
        assert_eq!(event.order_id, None);
        assert_eq!(event.organization_id, None);
        assert_eq!(event.amount, rust_decimal::Decimal::ZERO);
    }
}
