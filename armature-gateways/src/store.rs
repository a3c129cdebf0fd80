//! Persistence seam for payments, webhook events and orders

use crate::types::{PaymentGateway, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persisted payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub gateway: PaymentGateway,
    pub organization_id: String,
    pub user_id: String,
    pub order_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_payment_intent_id: Option<String>,
    /// Reference sent to the provider at checkout
    pub reference: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes of a payment to insert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub gateway: PaymentGateway,
    pub organization_id: String,
    pub user_id: String,
    pub order_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_payment_intent_id: Option<String>,
    pub reference: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewPayment {
    /// Create a pending payment
    pub fn new(
        gateway: PaymentGateway,
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            order_id: None,
            amount,
            currency: currency.into(),
            status: PaymentStatus::Pending,
            gateway_transaction_id: None,
            gateway_payment_intent_id: None,
            reference: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// With order
    pub fn order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// With status
    pub fn status(mut self, status: PaymentStatus) -> Self {
        self.status = status;
        self
    }

    /// With provider intent id
    pub fn intent_id(mut self, id: impl Into<String>) -> Self {
        self.gateway_payment_intent_id = Some(id.into());
        self
    }

    /// With provider reference
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// With metadata
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial payment update; `None` fields are left untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_payment_intent_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl PaymentUpdate {
    /// Update only the status
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status,
            gateway_transaction_id: None,
            gateway_payment_intent_id: None,
            metadata: None,
        }
    }
}

/// Persisted webhook delivery, unique per `(gateway, gateway_event_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub gateway: PaymentGateway,
    pub gateway_event_id: String,
    pub event_type: String,
    pub payment_id: Option<Uuid>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Attributes of a webhook event to insert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWebhookEvent {
    pub gateway: PaymentGateway,
    pub gateway_event_id: String,
    pub event_type: String,
    pub payment_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
}

/// The part of an order fulfillment touches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Backend error: {0}")]
    Other(String),
}

/// Persistence operations the ledger needs
///
/// Implementations must enforce uniqueness of `(gateway, gateway_event_id)`
/// for webhook events and of `gateway_payment_intent_id` across all payments,
/// reporting violations as [`StoreError::Conflict`].
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a payment
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StoreError>;

    /// Apply a partial update and bump `updated_at`
    async fn update_payment(&self, id: Uuid, update: PaymentUpdate)
        -> Result<Payment, StoreError>;

    /// Find a payment by internal id
    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, StoreError>;

    /// Find a payment by provider intent id
    async fn find_payment_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Find a payment by provider transaction id
    async fn find_payment_by_transaction_id(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Find the most recent payment opened with a provider reference
    async fn find_payment_by_reference(
        &self,
        gateway: PaymentGateway,
        reference: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Find the most recent payment for an order on a gateway
    async fn find_payment_by_order_id(
        &self,
        gateway: PaymentGateway,
        order_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Insert a webhook event, `Conflict` if the pair already exists
    async fn insert_webhook_event(
        &self,
        event: NewWebhookEvent,
    ) -> Result<WebhookEventRecord, StoreError>;

    /// Find a webhook event by its idempotency key
    async fn find_webhook_event(
        &self,
        gateway: PaymentGateway,
        gateway_event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError>;

    /// Flag a webhook event as processed
    async fn mark_webhook_event_processed(
        &self,
        gateway: PaymentGateway,
        gateway_event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark an order completed; `false` when the order does not exist
    async fn complete_order(&self, order_id: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct MemoryTables {
    payments: HashMap<Uuid, Payment>,
    webhook_events: HashMap<(PaymentGateway, String), WebhookEventRecord>,
    orders: HashMap<String, Order>,
}

impl MemoryTables {
    /// Reject an intent id already held by another payment
    fn claim_intent(&self, intent_id: &str, owner: Option<Uuid>) -> Result<(), StoreError> {
        let taken = self.payments.values().any(|p| {
            Some(p.id) != owner && p.gateway_payment_intent_id.as_deref() == Some(intent_id)
        });
        if taken {
            return Err(StoreError::Conflict(format!(
                "payments.gateway_payment_intent_id({})",
                intent_id
            )));
        }
        Ok(())
    }
}

/// In-memory store
///
/// Enforces the same uniqueness rules a relational store would.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<MemoryTables>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending order
    pub async fn insert_order(&self, order_id: impl Into<String>) {
        let id = order_id.into();
        let order = Order {
            id: id.clone(),
            status: OrderStatus::Pending,
            updated_at: Utc::now(),
        };
        self.tables.write().await.orders.insert(id, order);
    }

    /// Get an order
    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.tables.read().await.orders.get(order_id).cloned()
    }

    /// Get all payments
    pub async fn payments(&self) -> Vec<Payment> {
        self.tables.read().await.payments.values().cloned().collect()
    }

    /// Get all webhook events
    pub async fn webhook_events(&self) -> Vec<WebhookEventRecord> {
        self.tables
            .read()
            .await
            .webhook_events
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        let mut tables = self.tables.write().await;

        if let Some(intent_id) = &payment.gateway_payment_intent_id {
            tables.claim_intent(intent_id, None)?;
        }

        let now = Utc::now();
        let row = Payment {
            id: Uuid::new_v4(),
            gateway: payment.gateway,
            organization_id: payment.organization_id,
            user_id: payment.user_id,
            order_id: payment.order_id,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            gateway_transaction_id: payment.gateway_transaction_id,
            gateway_payment_intent_id: payment.gateway_payment_intent_id,
            reference: payment.reference,
            metadata: payment.metadata,
            created_at: now,
            updated_at: now,
        };
        tables.payments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_payment(
        &self,
        id: Uuid,
        update: PaymentUpdate,
    ) -> Result<Payment, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(intent_id) = &update.gateway_payment_intent_id {
            tables.claim_intent(intent_id, Some(id))?;
        }
        let row = tables
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;

        row.status = update.status;
        if let Some(tx) = update.gateway_transaction_id {
            row.gateway_transaction_id = Some(tx);
        }
        if let Some(intent) = update.gateway_payment_intent_id {
            row.gateway_payment_intent_id = Some(intent);
        }
        if let Some(metadata) = update.metadata {
            row.metadata = metadata;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, StoreError> {
        Ok(self.tables.read().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .values()
            .find(|p| p.gateway_payment_intent_id.as_deref() == Some(intent_id))
            .cloned())
    }

    async fn find_payment_by_transaction_id(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .values()
            .find(|p| {
                p.gateway == gateway
                    && p.gateway_transaction_id.as_deref() == Some(transaction_id)
            })
            .cloned())
    }

    async fn find_payment_by_reference(
        &self,
        gateway: PaymentGateway,
        reference: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .values()
            .filter(|p| p.gateway == gateway && p.reference.as_deref() == Some(reference))
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn find_payment_by_order_id(
        &self,
        gateway: PaymentGateway,
        order_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .values()
            .filter(|p| p.gateway == gateway && p.order_id.as_deref() == Some(order_id))
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn insert_webhook_event(
        &self,
        event: NewWebhookEvent,
    ) -> Result<WebhookEventRecord, StoreError> {
        let mut tables = self.tables.write().await;
        let key = (event.gateway, event.gateway_event_id.clone());
        if tables.webhook_events.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "webhook_events({}, {})",
                event.gateway, event.gateway_event_id
            )));
        }

        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            gateway: event.gateway,
            gateway_event_id: event.gateway_event_id,
            event_type: event.event_type,
            payment_id: event.payment_id,
            processed: false,
            processed_at: None,
            metadata: event.metadata,
            created_at: Utc::now(),
        };
        tables.webhook_events.insert(key, record.clone());
        Ok(record)
    }

    async fn find_webhook_event(
        &self,
        gateway: PaymentGateway,
        gateway_event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .webhook_events
            .get(&(gateway, gateway_event_id.to_string()))
            .cloned())
    }

    async fn mark_webhook_event_processed(
        &self,
        gateway: PaymentGateway,
        gateway_event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .webhook_events
            .get_mut(&(gateway, gateway_event_id.to_string()))
            .ok_or_else(|| {
                StoreError::NotFound(format!("webhook event {}/{}", gateway, gateway_event_id))
            })?;
        record.processed = true;
        record.processed_at = Some(processed_at);
        Ok(())
    }

    async fn complete_order(&self, order_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(order_id) {
            Some(order) => {
                order.status = OrderStatus::Completed;
                order.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            gateway: PaymentGateway::Flow,
            gateway_event_id: id.to_string(),
            event_type: "payment_confirmation".to_string(),
            payment_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_webhook_event_uniqueness() {
        let store = MemoryStore::new();
        store.insert_webhook_event(new_event("evt_1")).await.unwrap();

        let err = store.insert_webhook_event(new_event("evt_1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let mut other_gateway = new_event("evt_1");
        other_gateway.gateway = PaymentGateway::PayPal;
        assert!(store.insert_webhook_event(other_gateway).await.is_ok());
        assert_eq!(store.webhook_events().await.len(), 2);
    }

    #[tokio::test]
    async fn test_intent_id_is_unique_across_gateways() {
        let store = MemoryStore::new();
        let payment = NewPayment::new(PaymentGateway::Flow, "org1", "u1", Decimal::from(10), "CLP")
            .intent_id("shared_1");
        store.insert_payment(payment.clone()).await.unwrap();

        let err = store.insert_payment(payment).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let other_gateway =
            NewPayment::new(PaymentGateway::NowPayments, "org1", "u1", Decimal::from(10), "USD")
                .intent_id("shared_1");
        let err = store.insert_payment(other_gateway).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let found = store.find_payment_by_intent_id("shared_1").await.unwrap().unwrap();
        assert_eq!(found.gateway, PaymentGateway::Flow);
    }

    #[tokio::test]
    async fn test_update_cannot_take_another_payments_intent_id() {
        let store = MemoryStore::new();
        store
            .insert_payment(
                NewPayment::new(PaymentGateway::PayPal, "org1", "u1", Decimal::from(10), "USD")
                    .intent_id("ORDER-1"),
            )
            .await
            .unwrap();
        let other = store
            .insert_payment(NewPayment::new(
                PaymentGateway::NowPayments,
                "org1",
                "u1",
                Decimal::from(10),
                "USD",
            ))
            .await
            .unwrap();

        let mut update = PaymentUpdate::status(PaymentStatus::Pending);
        update.gateway_payment_intent_id = Some("ORDER-1".into());
        let err = store.update_payment(other.id, update).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_reference_lookup_is_per_gateway_and_latest() {
        let store = MemoryStore::new();
        let new = |gateway| {
            NewPayment::new(gateway, "org1", "u1", Decimal::from(10), "USD").reference("direct-abc")
        };
        store.insert_payment(new(PaymentGateway::MercadoPago)).await.unwrap();
        let latest = store.insert_payment(new(PaymentGateway::MercadoPago)).await.unwrap();

        let found = store
            .find_payment_by_reference(PaymentGateway::MercadoPago, "direct-abc")
            .await
            .unwrap()
            .unwrap();
        assert!(found.created_at <= latest.created_at);
        assert_eq!(found.reference.as_deref(), Some("direct-abc"));
        assert!(store
            .find_payment_by_reference(PaymentGateway::Flow, "direct-abc")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_partial_update_keeps_untouched_fields() {
        let store = MemoryStore::new();
        let payment = store
            .insert_payment(
                NewPayment::new(PaymentGateway::Flow, "org1", "u1", Decimal::from(10), "CLP")
                    .intent_id("tok_1")
                    .metadata(serde_json::json!({ "source": "checkout" })),
            )
            .await
            .unwrap();

        let mut update = PaymentUpdate::status(PaymentStatus::Succeeded);
        update.gateway_transaction_id = Some("fo_1".into());
        let updated = store.update_payment(payment.id, update).await.unwrap();

        assert_eq!(updated.status, PaymentStatus::Succeeded);
        assert_eq!(updated.gateway_transaction_id.as_deref(), Some("fo_1"));
        assert_eq!(updated.gateway_payment_intent_id.as_deref(), Some("tok_1"));
        assert_eq!(updated.metadata["source"], "checkout");
        assert!(updated.updated_at >= payment.updated_at);
    }

    #[tokio::test]
    async fn test_update_missing_payment() {
        let store = MemoryStore::new();
        let err = store
            .update_payment(Uuid::new_v4(), PaymentUpdate::status(PaymentStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_complete_order() {
        let store = MemoryStore::new();
        store.insert_order("ord_1").await;

        assert!(store.complete_order("ord_1").await.unwrap());
        assert!(!store.complete_order("missing").await.unwrap());
        assert_eq!(
            store.order("ord_1").await.unwrap().status,
            OrderStatus::Completed
        );
    }
}
