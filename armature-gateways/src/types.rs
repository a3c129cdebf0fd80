//! Canonical payment types shared by every gateway

use crate::error::{PaymentError, PaymentResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of references synthesized for payments without an order
pub const DIRECT_REFERENCE_PREFIX: &str = "direct-";

/// Canonical payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Get status name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Is a terminal state
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported gateway tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentGateway {
    /// Flow card/transfer gateway
    Flow,
    /// Mercado Pago checkout
    MercadoPago,
    /// PayPal wallet
    PayPal,
    /// NOWPayments crypto invoices
    NowPayments,
}

impl PaymentGateway {
    /// All known tags
    pub const ALL: [PaymentGateway; 4] = [
        Self::Flow,
        Self::MercadoPago,
        Self::PayPal,
        Self::NowPayments,
    ];

    /// Get tag string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::MercadoPago => "mercadopago",
            Self::PayPal => "paypal",
            Self::NowPayments => "nowpayments",
        }
    }
}

impl fmt::Display for PaymentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentGateway {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "flow" => Ok(Self::Flow),
            "mercadopago" | "mercado_pago" => Ok(Self::MercadoPago),
            "paypal" => Ok(Self::PayPal),
            "nowpayments" => Ok(Self::NowPayments),
            _ => Err(PaymentError::UnsupportedGateway(s.to_string())),
        }
    }
}

/// Request to open a checkout with a gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntentRequest {
    /// Caller's order, `None` for direct payments such as top-ups
    pub order_id: Option<String>,
    /// Amount in major currency units
    pub amount: Decimal,
    /// ISO 4217-like currency code
    pub currency: String,
    /// Paying user
    pub user_id: String,
    /// Owning tenant
    pub organization_id: String,
    /// Payer email, required by some gateways' hosted pages
    pub payer_email: Option<String>,
    /// Description shown to the payer
    pub description: Option<String>,
}

impl PaymentIntentRequest {
    /// Create a request
    pub fn new(
        order_id: Option<String>,
        amount: Decimal,
        currency: impl Into<String>,
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            amount,
            currency: currency.into().trim().to_uppercase(),
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            payer_email: None,
            description: None,
        }
    }

    /// With payer email
    pub fn payer_email(mut self, email: impl Into<String>) -> Self {
        self.payer_email = Some(email.into());
        self
    }

    /// With description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Reject non-positive amounts and empty currencies
    pub fn validate(&self) -> PaymentResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.currency.is_empty() {
            return Err(PaymentError::InvalidAmount("currency is required".into()));
        }
        Ok(())
    }

    /// Reference sent to the provider: the order id, or a fresh direct reference
    pub fn reference(&self) -> String {
        match &self.order_id {
            Some(id) => id.clone(),
            None => format!("{}{}", DIRECT_REFERENCE_PREFIX, uuid::Uuid::new_v4().simple()),
        }
    }

    /// Description or a generated one
    pub fn subject(&self, reference: &str) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Payment {}", reference))
    }
}

/// Recover the caller's order id from a provider reference
pub fn order_from_reference(reference: Option<&str>) -> Option<String> {
    reference
        .map(str::trim)
        .filter(|r| !r.is_empty() && !r.starts_with(DIRECT_REFERENCE_PREFIX))
        .map(str::to_string)
}

/// Result of opening a checkout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentResponse {
    /// Initial status, already mapped
    pub status: PaymentStatus,
    /// Redirect, hosted checkout or hosted invoice URL
    pub approval_url: Option<String>,
    /// Client-side token for frontend SDKs
    pub client_secret: Option<String>,
    /// Provider id of the order/preference/invoice
    pub gateway_payment_intent_id: String,
    /// Reference sent to the provider, echoed back in its webhooks
    pub reference: String,
}
