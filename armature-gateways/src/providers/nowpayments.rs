//! NOWPayments crypto invoice provider implementation
//!
//! IPN callbacks are signed with HMAC-SHA512 over the raw body and carry the
//! signature in `x-nowpayments-sig`.

use crate::{
    config::GatewaysConfig,
    error::{PaymentError, PaymentResult},
    money::{normalize_currency, parse_amount},
    provider::{PaymentProvider, ProviderClient, id_string, unmapped_status},
    signature::{hmac_sha512_hex, verify_hex},
    types::{PaymentGateway, PaymentIntentRequest, PaymentIntentResponse, PaymentStatus},
    webhook::{WebhookEvent, WebhookRequest, missing_fields},
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path NOWPayments posts IPN callbacks to
pub const IPN_PATH: &str = "/webhooks/nowpayments";

/// Payer return paths
pub const SUCCESS_PATH: &str = "/checkout/nowpayments/success";
pub const CANCEL_PATH: &str = "/checkout/nowpayments/cancel";

/// Header carrying the IPN signature
pub const SIGNATURE_HEADER: &str = "x-nowpayments-sig";

/// NOWPayments provider
pub struct NowPaymentsProvider {
    config: Arc<GatewaysConfig>,
    client: ProviderClient,
}

impl NowPaymentsProvider {
    /// Create a new NOWPayments provider
    pub fn new(config: Arc<GatewaysConfig>) -> Self {
        let client = ProviderClient::new(
            PaymentGateway::NowPayments,
            config.nowpayments.base_url(),
            config.timeout(),
        );
        Self { config, client }
    }

    fn verify_signature(&self, request: &WebhookRequest) -> PaymentResult<()> {
        let secret = self.config.nowpayments.ipn_secret.require()?;
        let Some(provided) = request.header_value(SIGNATURE_HEADER) else {
            warn!(gateway = "nowpayments", "IPN without signature header");
            return Err(PaymentError::InvalidWebhookSignature);
        };

        let expected = hmac_sha512_hex(secret.expose_secret().as_bytes(), &request.body);
        if !verify_hex(&expected, provided) {
            warn!(gateway = "nowpayments", "Rejected IPN with invalid signature");
            return Err(PaymentError::InvalidWebhookSignature);
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for NowPaymentsProvider {
    fn gateway(&self) -> PaymentGateway {
        PaymentGateway::NowPayments
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> PaymentResult<PaymentIntentResponse> {
        request.validate()?;
        let api_key = self.config.nowpayments.api_key.require()?;
        let reference = request.reference();

        let price_amount = request.amount.to_f64().ok_or_else(|| {
            PaymentError::InvalidAmount(format!("amount {} is out of range", request.amount))
        })?;

        let invoice = NowInvoiceRequest {
            price_amount,
            price_currency: request.currency.to_lowercase(),
            order_id: reference.clone(),
            order_description: request.subject(&reference),
            ipn_callback_url: self.config.callback_url(IPN_PATH)?,
            success_url: self.config.callback_url(SUCCESS_PATH)?,
            cancel_url: self.config.callback_url(CANCEL_PATH)?,
        };

        let response = self
            .client
            .send(
                "invoice",
                self.client
                    .http()
                    .post(self.client.url("/v1/invoice"))
                    .header("x-api-key", api_key.expose_secret())
                    .json(&invoice),
            )
            .await?;

        let created: NowInvoiceResponse = self
            .client
            .read_json("invoice", response, now_error_message)
            .await?;

        let invoice_id = id_string(created.id.as_ref())
            .ok_or_else(|| self.client.missing_in_response("invoice", "id"))?;
        let invoice_url = created
            .invoice_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| self.client.missing_in_response("invoice", "invoice_url"))?;

        info!(
            gateway = "nowpayments",
            intent_id = %invoice_id,
            reference = %reference,
            "Payment intent created"
        );

        Ok(PaymentIntentResponse {
            status: PaymentStatus::Pending,
            approval_url: Some(invoice_url),
            client_secret: None,
            gateway_payment_intent_id: invoice_id,
            reference,
        })
    }

    async fn process_webhook_event(&self, request: &WebhookRequest) -> PaymentResult<WebhookEvent> {
        self.verify_signature(request)?;

        let ipn: NowIpn = serde_json::from_slice(&request.body)?;
        let payment_id = id_string(ipn.payment_id.as_ref());
        let missing = missing_fields([
            ("payment_id", payment_id.as_deref()),
            ("payment_status", ipn.payment_status.as_deref()),
        ]);
        if !missing.is_empty() {
            return Err(PaymentError::MissingFields(missing));
        }
        let payment_id = payment_id.unwrap_or_default();
        let raw_status = ipn.payment_status.clone().unwrap_or_default();

        let mut event = WebhookEvent::new(
            PaymentGateway::NowPayments,
            format!("{}:{}", payment_id, raw_status),
            "ipn",
            self.map_status(&raw_status),
        );
        event.gateway_transaction_id = Some(payment_id);
        event.gateway_payment_intent_id = id_string(ipn.invoice_id.as_ref());
        event.amount = parse_amount(ipn.price_amount.as_ref());
        event.currency = ipn
            .price_currency
            .as_deref()
            .map(normalize_currency)
            .unwrap_or_default();
        event.set_reference(ipn.order_id.as_deref());
        event.metadata = serde_json::from_slice(&request.body)?;

        debug!(
            gateway = "nowpayments",
            event_id = %event.gateway_event_id,
            status = %event.status,
            "Parsed IPN"
        );
        Ok(event)
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        match provider_status.trim().to_lowercase().as_str() {
            "finished" => PaymentStatus::Succeeded,
            "waiting" | "confirming" | "confirmed" | "sending" | "partially_paid" => {
                PaymentStatus::Pending
            }
            "failed" | "expired" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            other => unmapped_status(PaymentGateway::NowPayments, other),
        }
    }
}

fn now_error_message(body: &Value) -> Option<String> {
    body.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

// NOWPayments API types

#[derive(Debug, Serialize)]
struct NowInvoiceRequest {
    price_amount: f64,
    price_currency: String,
    order_id: String,
    order_description: String,
    ipn_callback_url: String,
    success_url: String,
    cancel_url: String,
}

#[derive(Debug, Deserialize)]
struct NowInvoiceResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    invoice_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NowIpn {
    #[serde(default)]
    payment_id: Option<Value>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    invoice_id: Option<Value>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    price_amount: Option<Value>,
    #[serde(default)]
    price_currency: Option<String>,
}
