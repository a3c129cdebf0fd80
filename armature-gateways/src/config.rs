//! Gateway configuration
//!
//! Settings are read once at startup into [`GatewaysConfig`] and shared with
//! every adapter. Missing credentials are not an error here; the first call
//! that needs one fails with [`PaymentError::Config`] naming the variable.

use crate::error::{PaymentError, PaymentResult};
use secrecy::SecretString;
use std::env;
use std::time::Duration;

/// Default outbound request timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// A setting paired with the environment variable it comes from
#[derive(Debug)]
pub struct Setting<T> {
    var: &'static str,
    value: Option<T>,
}

impl<T> Setting<T> {
    /// An unset setting
    pub fn unset(var: &'static str) -> Self {
        Self { var, value: None }
    }

    /// A setting with a value
    pub fn with_value(var: &'static str, value: T) -> Self {
        Self {
            var,
            value: Some(value),
        }
    }

    /// Value, if set
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Value, or a configuration error naming the variable
    pub fn require(&self) -> PaymentResult<&T> {
        self.value
            .as_ref()
            .ok_or_else(|| PaymentError::missing_setting(self.var))
    }
}

impl Setting<String> {
    fn from_env(var: &'static str) -> Self {
        Self {
            var,
            value: read_var(var),
        }
    }
}

impl Setting<SecretString> {
    fn secret_from_env(var: &'static str) -> Self {
        Self {
            var,
            value: read_var(var).map(secret),
        }
    }
}

/// Flow settings
#[derive(Debug)]
pub struct FlowConfig {
    pub api_key: Setting<SecretString>,
    pub secret_key: Setting<SecretString>,
    pub sandbox: bool,
    pub api_url: Option<String>,
}

impl FlowConfig {
    /// Empty settings (sandbox)
    pub fn new() -> Self {
        Self {
            api_key: Setting::unset("FLOW_API_KEY"),
            secret_key: Setting::unset("FLOW_SECRET_KEY"),
            sandbox: true,
            api_url: None,
        }
    }

    /// Set credentials
    pub fn credentials(mut self, api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.api_key = Setting::with_value("FLOW_API_KEY", secret(api_key.into()));
        self.secret_key = Setting::with_value("FLOW_SECRET_KEY", secret(secret_key.into()));
        self
    }

    /// Override the API base URL (for testing)
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Resolved API base URL
    pub fn base_url(&self) -> &str {
        match &self.api_url {
            Some(url) => url,
            None if self.sandbox => "https://sandbox.flow.cl/api",
            None => "https://www.flow.cl/api",
        }
    }

    fn from_env() -> Self {
        Self {
            api_key: Setting::secret_from_env("FLOW_API_KEY"),
            secret_key: Setting::secret_from_env("FLOW_SECRET_KEY"),
            sandbox: read_flag("FLOW_SANDBOX", true),
            api_url: read_var("FLOW_API_URL"),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Mercado Pago settings
#[derive(Debug)]
pub struct MercadoPagoConfig {
    pub access_token: Setting<SecretString>,
    /// Enables `x-signature` verification when set
    pub webhook_secret: Setting<SecretString>,
    pub sandbox: bool,
    pub api_url: Option<String>,
}

impl MercadoPagoConfig {
    /// Empty settings (sandbox)
    pub fn new() -> Self {
        Self {
            access_token: Setting::unset("MERCADOPAGO_ACCESS_TOKEN"),
            webhook_secret: Setting::unset("MERCADOPAGO_WEBHOOK_SECRET"),
            sandbox: true,
            api_url: None,
        }
    }

    /// Set access token
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Setting::with_value("MERCADOPAGO_ACCESS_TOKEN", secret(token.into()));
        self
    }

    /// Set webhook signing secret
    pub fn webhook_secret(mut self, value: impl Into<String>) -> Self {
        self.webhook_secret =
            Setting::with_value("MERCADOPAGO_WEBHOOK_SECRET", secret(value.into()));
        self
    }

    /// Override the API base URL (for testing)
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Resolved API base URL
    pub fn base_url(&self) -> &str {
        self.api_url
            .as_deref()
            .unwrap_or("https://api.mercadopago.com")
    }

    fn from_env() -> Self {
        Self {
            access_token: Setting::secret_from_env("MERCADOPAGO_ACCESS_TOKEN"),
            webhook_secret: Setting::secret_from_env("MERCADOPAGO_WEBHOOK_SECRET"),
            sandbox: read_flag("MERCADOPAGO_SANDBOX", true),
            api_url: read_var("MERCADOPAGO_API_URL"),
        }
    }
}

impl Default for MercadoPagoConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// PayPal settings
#[derive(Debug)]
pub struct PayPalConfig {
    pub client_id: Setting<String>,
    pub client_secret: Setting<SecretString>,
    /// Required to accept webhooks
    pub webhook_id: Setting<String>,
    pub sandbox: bool,
    pub api_url: Option<String>,
}

impl PayPalConfig {
    /// Empty settings (sandbox)
    pub fn new() -> Self {
        Self {
            client_id: Setting::unset("PAYPAL_CLIENT_ID"),
            client_secret: Setting::unset("PAYPAL_CLIENT_SECRET"),
            webhook_id: Setting::unset("PAYPAL_WEBHOOK_ID"),
            sandbox: true,
            api_url: None,
        }
    }

    /// Set OAuth client credentials
    pub fn credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Setting::with_value("PAYPAL_CLIENT_ID", client_id.into());
        self.client_secret =
            Setting::with_value("PAYPAL_CLIENT_SECRET", secret(client_secret.into()));
        self
    }

    /// Set webhook ID for verification
    pub fn webhook_id(mut self, webhook_id: impl Into<String>) -> Self {
        self.webhook_id = Setting::with_value("PAYPAL_WEBHOOK_ID", webhook_id.into());
        self
    }

    /// Override the API base URL (for testing)
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Resolved API base URL
    pub fn base_url(&self) -> &str {
        match &self.api_url {
            Some(url) => url,
            None if self.sandbox => "https://api-m.sandbox.paypal.com",
            None => "https://api-m.paypal.com",
        }
    }

    fn from_env() -> Self {
        Self {
            client_id: Setting::from_env("PAYPAL_CLIENT_ID"),
            client_secret: Setting::secret_from_env("PAYPAL_CLIENT_SECRET"),
            webhook_id: Setting::from_env("PAYPAL_WEBHOOK_ID"),
            sandbox: read_flag("PAYPAL_SANDBOX", true),
            api_url: read_var("PAYPAL_API_URL"),
        }
    }
}

impl Default for PayPalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// NOWPayments settings
#[derive(Debug)]
pub struct NowPaymentsConfig {
    pub api_key: Setting<SecretString>,
    pub ipn_secret: Setting<SecretString>,
    pub sandbox: bool,
    pub api_url: Option<String>,
}

impl NowPaymentsConfig {
    /// Empty settings (sandbox)
    pub fn new() -> Self {
        Self {
            api_key: Setting::unset("NOWPAYMENTS_API_KEY"),
            ipn_secret: Setting::unset("NOWPAYMENTS_IPN_SECRET"),
            sandbox: true,
            api_url: None,
        }
    }

    /// Set API key and IPN secret
    pub fn credentials(mut self, api_key: impl Into<String>, ipn_secret: impl Into<String>) -> Self {
        self.api_key = Setting::with_value("NOWPAYMENTS_API_KEY", secret(api_key.into()));
        self.ipn_secret = Setting::with_value("NOWPAYMENTS_IPN_SECRET", secret(ipn_secret.into()));
        self
    }

    /// Override the API base URL (for testing)
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Resolved API base URL
    pub fn base_url(&self) -> &str {
        match &self.api_url {
            Some(url) => url,
            None if self.sandbox => "https://api-sandbox.nowpayments.io",
            None => "https://api.nowpayments.io",
        }
    }

    fn from_env() -> Self {
        Self {
            api_key: Setting::secret_from_env("NOWPAYMENTS_API_KEY"),
            ipn_secret: Setting::secret_from_env("NOWPAYMENTS_IPN_SECRET"),
            sandbox: read_flag("NOWPAYMENTS_SANDBOX", true),
            api_url: read_var("NOWPAYMENTS_API_URL"),
        }
    }
}

impl Default for NowPaymentsConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for all gateways
#[derive(Debug)]
pub struct GatewaysConfig {
    /// Base for callback and return URLs
    pub app_base_url: Setting<String>,
    /// Outbound request timeout
    pub http_timeout_secs: u64,
    pub flow: FlowConfig,
    pub mercadopago: MercadoPagoConfig,
    pub paypal: PayPalConfig,
    pub nowpayments: NowPaymentsConfig,
}

impl GatewaysConfig {
    /// Empty configuration
    pub fn new() -> Self {
        Self {
            app_base_url: Setting::unset("APP_BASE_URL"),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            flow: FlowConfig::new(),
            mercadopago: MercadoPagoConfig::new(),
            paypal: PayPalConfig::new(),
            nowpayments: NowPaymentsConfig::new(),
        }
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        Self {
            app_base_url: Setting::from_env("APP_BASE_URL"),
            http_timeout_secs: read_var("PAYMENTS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            flow: FlowConfig::from_env(),
            mercadopago: MercadoPagoConfig::from_env(),
            paypal: PayPalConfig::from_env(),
            nowpayments: NowPaymentsConfig::from_env(),
        }
    }

    /// Set the base URL for callbacks
    pub fn app_base_url(mut self, url: impl Into<String>) -> Self {
        self.app_base_url = Setting::with_value("APP_BASE_URL", url.into());
        self
    }

    pub fn flow(mut self, flow: FlowConfig) -> Self {
        self.flow = flow;
        self
    }

    pub fn mercadopago(mut self, mercadopago: MercadoPagoConfig) -> Self {
        self.mercadopago = mercadopago;
        self
    }

    pub fn paypal(mut self, paypal: PayPalConfig) -> Self {
        self.paypal = paypal;
        self
    }

    pub fn nowpayments(mut self, nowpayments: NowPaymentsConfig) -> Self {
        self.nowpayments = nowpayments;
        self
    }

    /// Outbound request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Absolute callback/return URL under the application base URL
    pub fn callback_url(&self, path: &str) -> PaymentResult<String> {
        let base = self.app_base_url.require()?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

impl Default for GatewaysConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn secret(value: String) -> SecretString {
    SecretString::new(value.into())
}

fn read_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_flag(var: &str, default: bool) -> bool {
    match read_var(var).map(|v| v.to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
