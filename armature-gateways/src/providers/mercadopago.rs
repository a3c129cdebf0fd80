//! Mercado Pago Checkout Pro provider implementation
//!
//! Checkouts are preferences; the payer completes them on the hosted
//! `init_point`. Notifications only carry a topic and a resource id, so the
//! payment itself is fetched from the API before an event is produced.

use crate::{
    config::GatewaysConfig,
    error::{PaymentError, PaymentResult},
    money::{normalize_currency, parse_amount},
    provider::{PaymentProvider, ProviderClient, id_string, unmapped_status},
    signature::{hmac_sha256_hex, parse_signature_header, verify_hex},
    types::{PaymentGateway, PaymentIntentRequest, PaymentIntentResponse, PaymentStatus},
    webhook::{WebhookEvent, WebhookRequest, missing_fields},
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path Mercado Pago sends notifications to
pub const NOTIFICATION_PATH: &str = "/webhooks/mercadopago";

/// Payer return paths
pub const SUCCESS_PATH: &str = "/checkout/mercadopago/success";
pub const FAILURE_PATH: &str = "/checkout/mercadopago/failure";
pub const PENDING_PATH: &str = "/checkout/mercadopago/pending";

const PAYMENT_TOPIC: &str = "payment";

/// Mercado Pago provider
pub struct MercadoPagoProvider {
    config: Arc<GatewaysConfig>,
    client: ProviderClient,
}

impl MercadoPagoProvider {
    /// Create a new Mercado Pago provider
    pub fn new(config: Arc<GatewaysConfig>) -> Self {
        let client = ProviderClient::new(
            PaymentGateway::MercadoPago,
            config.mercadopago.base_url(),
            config.timeout(),
        );
        Self { config, client }
    }

    fn access_token(&self) -> PaymentResult<&str> {
        Ok(self
            .config
            .mercadopago
            .access_token
            .require()?
            .expose_secret())
    }

    /// Check `x-signature` when a webhook secret is configured
    fn verify_signature(&self, request: &WebhookRequest, data_id: &str) -> PaymentResult<()> {
        let Some(secret) = self.config.mercadopago.webhook_secret.get() else {
            return Ok(());
        };

        let header = request
            .header_value("x-signature")
            .ok_or(PaymentError::InvalidWebhookSignature)?;
        let parts = parse_signature_header(header);
        let (Some(ts), Some(v1)) = (parts.get("ts"), parts.get("v1")) else {
            return Err(PaymentError::InvalidWebhookSignature);
        };

        let manifest = signature_manifest(
            data_id,
            request.header_value("x-request-id").unwrap_or_default(),
            ts,
        );
        let expected = hmac_sha256_hex(secret.expose_secret().as_bytes(), manifest.as_bytes());
        if !verify_hex(&expected, v1) {
            warn!(gateway = "mercadopago", data_id, "Rejected notification with invalid signature");
            return Err(PaymentError::InvalidWebhookSignature);
        }
        Ok(())
    }

    async fn fetch_payment(&self, payment_id: &str) -> PaymentResult<MpPayment> {
        let response = self
            .client
            .send(
                "payments/get",
                self.client
                    .http()
                    .get(self.client.url(&format!("/v1/payments/{}", payment_id)))
                    .bearer_auth(self.access_token()?),
            )
            .await?;

        self.client
            .read_json("payments/get", response, mp_error_message)
            .await
    }
}

/// Manifest Mercado Pago signs for `x-signature`
pub fn signature_manifest(data_id: &str, request_id: &str, ts: &str) -> String {
    format!("id:{};request-id:{};ts:{};", data_id, request_id, ts)
}

#[async_trait]
impl PaymentProvider for MercadoPagoProvider {
    fn gateway(&self) -> PaymentGateway {
        PaymentGateway::MercadoPago
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> PaymentResult<PaymentIntentResponse> {
        request.validate()?;
        let token = self.access_token()?;
        let reference = request.reference();

        let unit_price = request.amount.to_f64().ok_or_else(|| {
            PaymentError::InvalidAmount(format!("amount {} is out of range", request.amount))
        })?;

        let preference = MpPreferenceRequest {
            items: vec![MpItem {
                id: reference.clone(),
                title: request.subject(&reference),
                quantity: 1,
                unit_price,
                currency_id: request.currency.clone(),
            }],
            payer: request.payer_email.as_ref().map(|email| MpPayer {
                email: email.clone(),
            }),
            external_reference: reference.clone(),
            metadata: json!({
                "organization_id": request.organization_id,
                "user_id": request.user_id,
                "order_id": request.order_id,
            }),
            back_urls: MpBackUrls {
                success: self.config.callback_url(SUCCESS_PATH)?,
                failure: self.config.callback_url(FAILURE_PATH)?,
                pending: self.config.callback_url(PENDING_PATH)?,
            },
            auto_return: "approved".to_string(),
            notification_url: self.config.callback_url(NOTIFICATION_PATH)?,
        };

        let response = self
            .client
            .send(
                "checkout/preferences",
                self.client
                    .http()
                    .post(self.client.url("/checkout/preferences"))
                    .bearer_auth(token)
                    .json(&preference),
            )
            .await?;

        let created: MpPreferenceResponse = self
            .client
            .read_json("checkout/preferences", response, mp_error_message)
            .await?;

        let preference_id = id_string(created.id.as_ref())
            .ok_or_else(|| self.client.missing_in_response("checkout/preferences", "id"))?;
        let (field, url) = if self.config.mercadopago.sandbox {
            ("sandbox_init_point", created.sandbox_init_point)
        } else {
            ("init_point", created.init_point)
        };
        let url = url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| self.client.missing_in_response("checkout/preferences", field))?;

        info!(
            gateway = "mercadopago",
            intent_id = %preference_id,
            reference = %reference,
            sandbox = self.config.mercadopago.sandbox,
            "Payment intent created"
        );

        Ok(PaymentIntentResponse {
            status: PaymentStatus::Pending,
            approval_url: Some(url),
            client_secret: Some(preference_id.clone()),
            gateway_payment_intent_id: preference_id,
            reference,
        })
    }

    async fn process_webhook_event(&self, request: &WebhookRequest) -> PaymentResult<WebhookEvent> {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let body_str = |path: &[&str]| {
            let mut value = &body;
            for key in path {
                value = value.get(*key)?;
            }
            id_string(Some(value))
        };

        let topic = request
            .query_value("topic")
            .or_else(|| request.query_value("type"))
            .map(str::to_string)
            .or_else(|| body_str(&["topic"]))
            .or_else(|| body_str(&["type"]));
        let data_id = request
            .query_value("id")
            .or_else(|| request.query_value("data.id"))
            .map(str::to_string)
            .or_else(|| body_str(&["data", "id"]))
            .or_else(|| body_str(&["id"]));

        let missing = missing_fields([("topic", topic.as_deref()), ("id", data_id.as_deref())]);
        if !missing.is_empty() {
            return Err(PaymentError::MissingFields(missing));
        }
        let topic = topic.unwrap_or_default();
        let data_id = data_id.unwrap_or_default();

        if topic != PAYMENT_TOPIC {
            debug!(gateway = "mercadopago", topic = %topic, "Ignoring notification topic");
            return Err(PaymentError::UnhandledEventType(topic));
        }
        // Payment ids are numeric; anything else must not reach the API path
        if !data_id.bytes().all(|b| b.is_ascii_digit()) {
            warn!(gateway = "mercadopago", data_id = %data_id, "Rejected notification with a malformed id");
            return Err(PaymentError::MissingFields(vec!["id"]));
        }

        self.verify_signature(request, &data_id)?;

        let payment = self.fetch_payment(&data_id).await?;
        let payment_id = id_string(payment.id.as_ref())
            .ok_or_else(|| self.client.missing_in_response("payments/get", "id"))?;
        let raw_status = payment
            .status
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.client.missing_in_response("payments/get", "status"))?;

        let metadata_str = |key: &str| {
            payment
                .metadata
                .as_ref()
                .and_then(|m| id_string(m.get(key)))
        };

        let mut event = WebhookEvent::new(
            PaymentGateway::MercadoPago,
            format!("{}:{}", payment_id, raw_status),
            topic,
            self.map_status(&raw_status),
        );
        event.gateway_transaction_id = Some(payment_id);
        event.gateway_payment_intent_id = payment.preference_id.clone().filter(|p| !p.is_empty());
        event.amount = parse_amount(payment.transaction_amount.as_ref());
        event.currency = payment
            .currency_id
            .as_deref()
            .map(normalize_currency)
            .unwrap_or_default();
        event.set_reference(payment.external_reference.as_deref());
        if event.order_id.is_none() {
            event.order_id = metadata_str("order_id");
        }
        event.organization_id = metadata_str("organization_id");
        event.metadata = json!({
            "notification_id": data_id,
            "status_detail": payment.status_detail,
            "external_reference": payment.external_reference,
            "payment_metadata": payment.metadata,
        });

        debug!(
            gateway = "mercadopago",
            event_id = %event.gateway_event_id,
            status = %event.status,
            "Parsed payment notification"
        );
        Ok(event)
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        match provider_status.trim().to_lowercase().as_str() {
            "approved" => PaymentStatus::Succeeded,
            "pending" | "in_process" | "authorized" | "in_mediation" => PaymentStatus::Pending,
            "rejected" | "cancelled" => PaymentStatus::Failed,
            "refunded" | "charged_back" => PaymentStatus::Refunded,
            other => unmapped_status(PaymentGateway::MercadoPago, other),
        }
    }
}

fn mp_error_message(body: &Value) -> Option<String> {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// Mercado Pago API types

#[derive(Debug, Serialize)]
struct MpPreferenceRequest {
    items: Vec<MpItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<MpPayer>,
    external_reference: String,
    metadata: Value,
    back_urls: MpBackUrls,
    auto_return: String,
    notification_url: String,
}

#[derive(Debug, Serialize)]
struct MpItem {
    id: String,
    title: String,
    quantity: u32,
    unit_price: f64,
    currency_id: String,
}

#[derive(Debug, Serialize)]
struct MpPayer {
    email: String,
}

#[derive(Debug, Serialize)]
struct MpBackUrls {
    success: String,
    failure: String,
    pending: String,
}

#[derive(Debug, Deserialize)]
struct MpPreferenceResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    init_point: Option<String>,
    #[serde(default)]
    sandbox_init_point: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MpPayment {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    status_detail: Option<String>,
    #[serde(default)]
    external_reference: Option<String>,
    #[serde(default)]
    transaction_amount: Option<Value>,
    #[serde(default)]
    currency_id: Option<String>,
    #[serde(default)]
    preference_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}
