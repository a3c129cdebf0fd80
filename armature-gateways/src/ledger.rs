//! Payment ledger service
//!
//! Thin wrappers around [`PaymentStore`] that carry the ledger's rules: the
//! webhook idempotency gate, partial status updates, and best-effort
//! bookkeeping after a webhook's effects are applied.

use crate::error::{PaymentError, PaymentResult};
use crate::store::{
    NewPayment, NewWebhookEvent, Payment, PaymentStore, PaymentUpdate, StoreError,
};
use crate::types::{PaymentGateway, PaymentStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Ledger over an injected store
#[derive(Clone)]
pub struct PaymentLedger {
    store: Arc<dyn PaymentStore>,
}

impl PaymentLedger {
    /// Create a ledger
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// Get the store
    pub fn store(&self) -> &Arc<dyn PaymentStore> {
        &self.store
    }

    /// Insert a payment; store errors propagate
    pub async fn create_payment(&self, payment: NewPayment) -> PaymentResult<Payment> {
        let gateway = payment.gateway;
        let payment = self.store.insert_payment(payment).await.map_err(|e| {
            error!(gateway = %gateway, error = %e, "Failed to record payment");
            PaymentError::from(e)
        })?;

        info!(
            payment_id = %payment.id,
            gateway = %payment.gateway,
            intent_id = ?payment.gateway_payment_intent_id,
            status = %payment.status,
            "Payment recorded"
        );
        Ok(payment)
    }

    /// Update a payment's status and any supplied optional fields
    pub async fn update_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        gateway_transaction_id: Option<String>,
        metadata: Option<serde_json::Value>,
        gateway_payment_intent_id: Option<String>,
    ) -> PaymentResult<Payment> {
        let update = PaymentUpdate {
            status,
            gateway_transaction_id,
            gateway_payment_intent_id,
            metadata,
        };
        let payment = self.store.update_payment(payment_id, update).await?;
        info!(payment_id = %payment_id, status = %status, "Payment status updated");
        Ok(payment)
    }

    /// Look up a payment by internal id
    pub async fn get_payment_by_id(&self, payment_id: Uuid) -> PaymentResult<Option<Payment>> {
        Ok(self.store.find_payment(payment_id).await?)
    }

    /// Look up a payment by the provider's intent id
    pub async fn get_payment_by_gateway_payment_intent_id(
        &self,
        intent_id: &str,
    ) -> PaymentResult<Option<Payment>> {
        Ok(self.store.find_payment_by_intent_id(intent_id).await?)
    }

    /// Look up a payment by the provider's transaction id
    pub async fn get_payment_by_gateway_transaction_id(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> PaymentResult<Option<Payment>> {
        Ok(self
            .store
            .find_payment_by_transaction_id(gateway, transaction_id)
            .await?)
    }

    /// Look up the latest payment opened with a provider reference
    pub async fn get_payment_by_reference(
        &self,
        gateway: PaymentGateway,
        reference: &str,
    ) -> PaymentResult<Option<Payment>> {
        Ok(self.store.find_payment_by_reference(gateway, reference).await?)
    }

    /// Look up the latest payment opened for an order on a gateway
    pub async fn get_payment_by_order_id(
        &self,
        gateway: PaymentGateway,
        order_id: &str,
    ) -> PaymentResult<Option<Payment>> {
        Ok(self.store.find_payment_by_order_id(gateway, order_id).await?)
    }

    /// Idempotency gate for webhook deliveries
    ///
    /// Returns the `processed` flag of an existing `(gateway, gateway_event_id)`
    /// record without writing anything; otherwise inserts an unprocessed record
    /// and returns `false`. Callers must skip all side effects on `true`.
    pub async fn record_webhook_event(
        &self,
        gateway: PaymentGateway,
        gateway_event_id: &str,
        event_type: &str,
        payment_id: Option<Uuid>,
        metadata: Option<serde_json::Value>,
    ) -> PaymentResult<bool> {
        if let Some(existing) = self
            .store
            .find_webhook_event(gateway, gateway_event_id)
            .await?
        {
            debug!(
                gateway = %gateway,
                event_id = gateway_event_id,
                processed = existing.processed,
                "Webhook event already recorded"
            );
            return Ok(existing.processed);
        }

        let event = NewWebhookEvent {
            gateway,
            gateway_event_id: gateway_event_id.to_string(),
            event_type: event_type.to_string(),
            payment_id,
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        };

        match self.store.insert_webhook_event(event).await {
            Ok(_) => Ok(false),
            // A concurrent delivery won the insert; read its row
            Err(StoreError::Conflict(_)) => {
                let existing = self
                    .store
                    .find_webhook_event(gateway, gateway_event_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::NotFound(format!(
                            "webhook event {}/{}",
                            gateway, gateway_event_id
                        ))
                    })?;
                Ok(existing.processed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flag a webhook event as processed; failures are logged, never returned
    pub async fn mark_webhook_event_as_processed(
        &self,
        gateway: PaymentGateway,
        gateway_event_id: &str,
    ) {
        if let Err(e) = self
            .store
            .mark_webhook_event_processed(gateway, gateway_event_id, Utc::now())
            .await
        {
            warn!(
                gateway = %gateway,
                event_id = gateway_event_id,
                error = %e,
                "Failed to mark webhook event as processed"
            );
        }
    }

    /// Mark an order completed; a missing order is logged, not an error
    pub async fn fulfill_order(&self, order_id: &str) -> PaymentResult<()> {
        if self.store.complete_order(order_id).await? {
            info!(order_id, "Order fulfilled");
        } else {
            warn!(order_id, "Order to fulfill not found");
        }
        Ok(())
    }
}
