//! Multi-Gateway Payments for Armature Framework
//!
//! Opens hosted checkouts with several payment gateways and turns their
//! webhooks into one canonical event, recorded idempotently in a payment
//! ledger.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       PaymentProcessor                          │
//! │        checkout(gateway, request) | handle_webhook(...)         │
//! └──────────────┬──────────────────────────────────┬───────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌─────────────────────────────────┐   ┌───────────────────────────┐
//! │     get_gateway(tag, config)    │   │       PaymentLedger       │
//! │ ┌──────┐┌───────┐┌──────┐┌────┐ │   │ record_webhook_event      │
//! │ │ Flow ││ MPago ││PayPal││NOWP│ │   │ update_payment_status     │
//! │ └──────┘└───────┘└──────┘└────┘ │   │ fulfill_order             │
//! └─────────────────────────────────┘   └─────────────┬─────────────┘
//!                                                     ▼
//!                                          PaymentStore (injected)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use armature_gateways::*;
//! use std::sync::Arc;
//!
//! let config = Arc::new(GatewaysConfig::from_env());
//! let processor = PaymentProcessor::new(config, Arc::new(MemoryStore::new()));
//!
//! // Open a checkout and redirect the payer
//! let request = PaymentIntentRequest::new(
//!     Some("ord_1".into()),
//!     Decimal::from(19990),
//!     "CLP",
//!     "u1",
//!     "org1",
//! );
//! let (intent, payment) = processor.checkout(PaymentGateway::Flow, &request).await?;
//!
//! // Later, from the webhook endpoint
//! let outcome = processor
//!     .handle_webhook(PaymentGateway::Flow, &WebhookRequest::post(raw_body))
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod ledger;
pub mod money;
pub mod provider;
pub mod providers;
pub mod signature;
pub mod store;
pub mod types;
pub mod webhook;

pub use config::*;
pub use error::*;
pub use factory::{get_gateway, get_gateway_by_name};
pub use ledger::PaymentLedger;
pub use provider::*;
pub use store::*;
pub use types::*;
pub use webhook::*;

pub use rust_decimal::Decimal;

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What handling a webhook did
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Effects were applied to a known payment
    Applied {
        event: WebhookEvent,
        payment: Payment,
    },
    /// The event was recorded but matches no payment
    Unmatched { event: WebhookEvent },
    /// The event was already processed; nothing was done
    Duplicate { gateway_event_id: String },
}

/// Checkout and webhook orchestration over the ledger
#[derive(Clone)]
pub struct PaymentProcessor {
    config: Arc<GatewaysConfig>,
    ledger: PaymentLedger,
}

impl PaymentProcessor {
    /// Create a processor
    pub fn new(config: Arc<GatewaysConfig>, store: Arc<dyn PaymentStore>) -> Self {
        Self {
            config,
            ledger: PaymentLedger::new(store),
        }
    }

    /// Get the ledger
    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    /// Get the configuration
    pub fn config(&self) -> &Arc<GatewaysConfig> {
        &self.config
    }

    /// Open a checkout and record the pending payment
    pub async fn checkout(
        &self,
        gateway: PaymentGateway,
        request: &PaymentIntentRequest,
    ) -> PaymentResult<(PaymentIntentResponse, Payment)> {
        let provider = get_gateway(gateway, Arc::clone(&self.config))?;
        let intent = provider.create_payment_intent(request).await?;

        let mut payment = NewPayment::new(
            gateway,
            request.organization_id.clone(),
            request.user_id.clone(),
            request.amount,
            request.currency.clone(),
        )
        .status(intent.status)
        .intent_id(intent.gateway_payment_intent_id.clone())
        .reference(intent.reference.clone())
        .metadata(json!({ "approval_url": intent.approval_url }));
        if let Some(order_id) = &request.order_id {
            payment = payment.order(order_id.clone());
        }

        let payment = self.ledger.create_payment(payment).await?;
        Ok((intent, payment))
    }

    /// Authenticate a webhook and apply its effects once
    ///
    /// Authenticity and parsing errors are returned before anything is
    /// written.
    pub async fn handle_webhook(
        &self,
        gateway: PaymentGateway,
        request: &WebhookRequest,
    ) -> PaymentResult<WebhookOutcome> {
        let provider = get_gateway(gateway, Arc::clone(&self.config))?;
        let mut event = provider.process_webhook_event(request).await?;

        let payment = self.resolve_payment(&event).await?;
        if let Some(payment) = &payment {
            if event.organization_id.is_none() {
                event.organization_id = Some(payment.organization_id.clone());
            }
            if event.order_id.is_none() {
                event.order_id = payment.order_id.clone();
            }
        }

        let processed = self
            .ledger
            .record_webhook_event(
                gateway,
                &event.gateway_event_id,
                &event.event_type,
                payment.as_ref().map(|p| p.id),
                Some(event.metadata.clone()),
            )
            .await?;
        if processed {
            info!(
                gateway = %gateway,
                event_id = %event.gateway_event_id,
                "Webhook event already processed, skipping"
            );
            return Ok(WebhookOutcome::Duplicate {
                gateway_event_id: event.gateway_event_id,
            });
        }

        let Some(payment) = payment else {
            warn!(
                gateway = %gateway,
                event_id = %event.gateway_event_id,
                intent_id = ?event.gateway_payment_intent_id,
                transaction_id = ?event.gateway_transaction_id,
                reference = ?event.reference,
                "Webhook event matches no payment"
            );
            return Ok(WebhookOutcome::Unmatched { event });
        };

        let payment = self.apply(&event, payment).await?;

        if event.is_success() {
            if let Some(order_id) = &event.order_id {
                self.ledger.fulfill_order(order_id).await?;
            }
        }

        self.ledger
            .mark_webhook_event_as_processed(gateway, &event.gateway_event_id)
            .await;

        Ok(WebhookOutcome::Applied { event, payment })
    }

    /// Find the payment an event refers to: intent id, transaction id,
    /// checkout reference, then order
    async fn resolve_payment(&self, event: &WebhookEvent) -> PaymentResult<Option<Payment>> {
        if let Some(intent_id) = &event.gateway_payment_intent_id {
            if let Some(payment) = self
                .ledger
                .get_payment_by_gateway_payment_intent_id(intent_id)
                .await?
                .filter(|p| p.gateway == event.gateway)
            {
                return Ok(Some(payment));
            }
        }

        if let Some(tx) = &event.gateway_transaction_id {
            if let Some(payment) = self
                .ledger
                .get_payment_by_gateway_transaction_id(event.gateway, tx)
                .await?
            {
                return Ok(Some(payment));
            }
        }

        if let Some(reference) = &event.reference {
            if let Some(payment) = self
                .ledger
                .get_payment_by_reference(event.gateway, reference)
                .await?
            {
                return Ok(Some(payment));
            }
        }

        match &event.order_id {
            Some(order_id) => {
                self.ledger
                    .get_payment_by_order_id(event.gateway, order_id)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Write the event's status and ids onto the payment
    ///
    /// Ids already on the payment are kept.
    async fn apply(&self, event: &WebhookEvent, payment: Payment) -> PaymentResult<Payment> {
        let mut status = event.status;
        if payment.status.is_final() && status == PaymentStatus::Pending {
            debug!(
                payment_id = %payment.id,
                current = %payment.status,
                "Ignoring pending event for a settled payment"
            );
            status = payment.status;
        }

        let mut metadata = match payment.metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert("last_webhook".to_string(), event.metadata.clone());

        self.ledger
            .update_payment_status(
                payment.id,
                status,
                match payment.gateway_transaction_id {
                    Some(_) => None,
                    None => event.gateway_transaction_id.clone(),
                },
                Some(serde_json::Value::Object(metadata)),
                match payment.gateway_payment_intent_id {
                    Some(_) => None,
                    None => event.gateway_payment_intent_id.clone(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::hmac_sha512_hex;

    fn processor() -> (PaymentProcessor, MemoryStore) {
        let config = GatewaysConfig::new()
            .app_base_url("https://shop.example.com")
            .nowpayments(NowPaymentsConfig::new().credentials("api-key", "ipn-secret"));
        let store = MemoryStore::new();
        (
            PaymentProcessor::new(Arc::new(config), Arc::new(store.clone())),
            store,
        )
    }

    fn ipn(payment_id: u64, status: &str, invoice_id: &str, order_id: &str) -> WebhookRequest {
        let body = json!({
            "payment_id": payment_id,
            "invoice_id": invoice_id,
            "payment_status": status,
            "order_id": order_id,
            "price_amount": 25,
            "price_currency": "usd"
        })
        .to_string();
        let sig = hmac_sha512_hex(b"ipn-secret", body.as_bytes());
        WebhookRequest::post(body).header("x-nowpayments-sig", sig)
    }

    async fn seed_payment(store: &MemoryStore) -> Payment {
        store.insert_order("ord_7").await;
        store
            .insert_payment(
                NewPayment::new(PaymentGateway::NowPayments, "org1", "u1", Decimal::from(25), "USD")
                    .order("ord_7")
                    .intent_id("inv_1"),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_finished_ipn_settles_and_fulfills() {
        let (processor, store) = processor();
        let payment = seed_payment(&store).await;

        let outcome = processor
            .handle_webhook(PaymentGateway::NowPayments, &ipn(501, "finished", "inv_1", "ord_7"))
            .await
            .unwrap();

        let WebhookOutcome::Applied { event, payment: updated } = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(updated.id, payment.id);
        assert_eq!(updated.status, PaymentStatus::Succeeded);
        assert_eq!(updated.gateway_transaction_id.as_deref(), Some("501"));
        assert_eq!(event.organization_id.as_deref(), Some("org1"));
        assert_eq!(store.order("ord_7").await.unwrap().status, OrderStatus::Completed);

        let events = store.webhook_events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].processed);
        assert_eq!(events[0].payment_id, Some(payment.id));
    }

    #[tokio::test]
    async fn test_replayed_ipn_is_a_duplicate() {
        let (processor, store) = processor();
        seed_payment(&store).await;
        let request = ipn(502, "finished", "inv_1", "ord_7");

        processor
            .handle_webhook(PaymentGateway::NowPayments, &request)
            .await
            .unwrap();
        let replay = processor
            .handle_webhook(PaymentGateway::NowPayments, &request)
            .await
            .unwrap();

        assert_eq!(
            replay,
            WebhookOutcome::Duplicate {
                gateway_event_id: "502:finished".to_string()
            }
        );
        assert_eq!(store.webhook_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_late_pending_does_not_reopen_payment() {
        let (processor, store) = processor();
        seed_payment(&store).await;

        processor
            .handle_webhook(PaymentGateway::NowPayments, &ipn(503, "finished", "inv_1", "ord_7"))
            .await
            .unwrap();
        let outcome = processor
            .handle_webhook(PaymentGateway::NowPayments, &ipn(503, "confirming", "inv_1", "ord_7"))
            .await
            .unwrap();

        let WebhookOutcome::Applied { payment, .. } = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(payment.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unmatched_event_is_recorded_without_fulfillment() {
        let (processor, store) = processor();
        store.insert_order("ord_9").await;

        let outcome = processor
            .handle_webhook(PaymentGateway::NowPayments, &ipn(504, "finished", "inv_x", "ord_9"))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Unmatched { .. }));
        assert_eq!(store.order("ord_9").await.unwrap().status, OrderStatus::Pending);
        let events = store.webhook_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payment_id, None);
        assert!(!events[0].processed);
    }

    #[tokio::test]
    async fn test_later_event_keeps_first_transaction_id() {
        let (processor, store) = processor();
        seed_payment(&store).await;

        processor
            .handle_webhook(PaymentGateway::NowPayments, &ipn(505, "finished", "inv_1", "ord_7"))
            .await
            .unwrap();
        let outcome = processor
            .handle_webhook(PaymentGateway::NowPayments, &ipn(506, "refunded", "inv_1", "ord_7"))
            .await
            .unwrap();

        let WebhookOutcome::Applied { payment, .. } = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(payment.gateway_transaction_id.as_deref(), Some("505"));
    }

    #[tokio::test]
    async fn test_direct_payment_resolves_by_reference() {
        let (processor, store) = processor();
        let payment = store
            .insert_payment(
                NewPayment::new(PaymentGateway::NowPayments, "org1", "u1", Decimal::from(25), "USD")
                    .reference("direct-abc"),
            )
            .await
            .unwrap();

        let outcome = processor
            .handle_webhook(PaymentGateway::NowPayments, &ipn(507, "finished", "inv_y", "direct-abc"))
            .await
            .unwrap();

        let WebhookOutcome::Applied { event, payment: updated } = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(updated.id, payment.id);
        assert_eq!(updated.status, PaymentStatus::Succeeded);
        assert_eq!(updated.gateway_payment_intent_id.as_deref(), Some("inv_y"));
        assert_eq!(event.order_id, None);
    }

    #[tokio::test]
    async fn test_paypal_event_without_webhook_id_writes_nothing() {
        let config = GatewaysConfig::new().paypal(
            PayPalConfig::new()
                .credentials("client", "secret")
                .api_url("http://127.0.0.1:9"),
        );
        let store = MemoryStore::new();
        let processor = PaymentProcessor::new(Arc::new(config), Arc::new(store.clone()));
        store.insert_order("ord_1").await;
        let payment = store
            .insert_payment(
                NewPayment::new(PaymentGateway::PayPal, "org1", "u1", Decimal::from(30), "USD")
                    .order("ord_1")
                    .intent_id("ORDER-1"),
            )
            .await
            .unwrap();
        let body = json!({
            "id": "WH-FORGED",
            "event_type": "CHECKOUT.ORDER.APPROVED",
            "resource": {"id": "ORDER-1", "status": "APPROVED"}
        });

        let err = processor
            .handle_webhook(PaymentGateway::PayPal, &WebhookRequest::post(body.to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, PaymentError::Config(_)));
        assert!(store.webhook_events().await.is_empty());
        assert_eq!(store.order("ord_1").await.unwrap().status, OrderStatus::Pending);
        let stored = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_invalid_signature_writes_nothing() {
        let (processor, store) = processor();
        let request = WebhookRequest::post(r#"{"payment_id":1,"payment_status":"finished"}"#)
            .header("x-nowpayments-sig", "00");

        let err = processor
            .handle_webhook(PaymentGateway::NowPayments, &request)
            .await
            .unwrap_err();

        assert!(err.is_authenticity_failure());
        assert!(store.webhook_events().await.is_empty());
    }
}
