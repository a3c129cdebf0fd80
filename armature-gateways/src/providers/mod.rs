//! Gateway adapter implementations

#[cfg(feature = "flow")]
pub mod flow;

#[cfg(feature = "mercadopago")]
pub mod mercadopago;

#[cfg(feature = "paypal")]
pub mod paypal;

#[cfg(feature = "nowpayments")]
pub mod nowpayments;

#[cfg(feature = "flow")]
pub use flow::FlowProvider;

#[cfg(feature = "mercadopago")]
pub use mercadopago::MercadoPagoProvider;

#[cfg(feature = "paypal")]
pub use paypal::PayPalProvider;

#[cfg(feature = "nowpayments")]
pub use nowpayments::NowPaymentsProvider;
