//! Gateway factory

use crate::{
    config::GatewaysConfig,
    error::{PaymentError, PaymentResult},
    provider::PaymentProvider,
    types::PaymentGateway,
};
use std::sync::Arc;

/// Build the adapter for a gateway tag
///
/// A fresh adapter is returned on every call. Tags whose Cargo feature is
/// disabled are unsupported.
pub fn get_gateway(
    gateway: PaymentGateway,
    config: Arc<GatewaysConfig>,
) -> PaymentResult<Box<dyn PaymentProvider>> {
    match gateway {
        #[cfg(feature = "flow")]
        PaymentGateway::Flow => Ok(Box::new(crate::providers::FlowProvider::new(config))),
        #[cfg(feature = "mercadopago")]
        PaymentGateway::MercadoPago => {
            Ok(Box::new(crate::providers::MercadoPagoProvider::new(config)))
        }
        #[cfg(feature = "paypal")]
        PaymentGateway::PayPal => Ok(Box::new(crate::providers::PayPalProvider::new(config))),
        #[cfg(feature = "nowpayments")]
        PaymentGateway::NowPayments => {
            Ok(Box::new(crate::providers::NowPaymentsProvider::new(config)))
        }
        #[allow(unreachable_patterns)]
        other => {
            let _ = config;
            Err(PaymentError::UnsupportedGateway(other.to_string()))
        }
    }
}

/// Build the adapter for a gateway name such as `"paypal"`
pub fn get_gateway_by_name(
    name: &str,
    config: Arc<GatewaysConfig>,
) -> PaymentResult<Box<dyn PaymentProvider>> {
    get_gateway(name.parse()?, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<GatewaysConfig> {
        Arc::new(GatewaysConfig::new())
    }

    #[test]
    fn test_every_tag_has_an_adapter() {
        for gateway in PaymentGateway::ALL {
            let provider = get_gateway(gateway, config()).unwrap();
            assert_eq!(provider.gateway(), gateway);
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let provider = get_gateway_by_name("nowpayments", config()).unwrap();
        assert_eq!(provider.gateway(), PaymentGateway::NowPayments);
    }

    #[test]
    fn test_unknown_name_is_unsupported() {
        let err = get_gateway_by_name("stripe", config()).err().unwrap();
        assert_eq!(err.to_string(), "unsupported gateway type: stripe");
    }
}
