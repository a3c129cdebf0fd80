//! Amount formatting and parsing

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Currencies without minor units
const ZERO_DECIMAL: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "ISK", "JPY", "KMF", "KRW", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// Get decimal places for a currency code (0 for zero-decimal currencies)
pub fn decimals(currency: &str) -> u32 {
    if is_zero_decimal(currency) { 0 } else { 2 }
}

/// Is a zero-decimal currency
pub fn is_zero_decimal(currency: &str) -> bool {
    let code = currency.trim().to_uppercase();
    ZERO_DECIMAL.contains(&code.as_str())
}

/// Format an amount with the currency's precision, e.g. `29.90` or `19990`
pub fn format_amount(amount: Decimal, currency: &str) -> String {
    let dp = decimals(currency);
    format!("{:.prec$}", amount.round_dp(dp), prec = dp as usize)
}

/// Normalize a currency code to uppercase
pub fn normalize_currency(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Parse a JSON number or numeric string, zero when absent or unparsable
pub fn parse_amount(value: Option<&Value>) -> Decimal {
    match value {
        Some(Value::Number(n)) => parse_amount_str(&n.to_string()),
        Some(Value::String(s)) => parse_amount_str(s),
        _ => Decimal::ZERO,
    }
}

/// Parse a numeric string, zero when unparsable
pub fn parse_amount_str(s: &str) -> Decimal {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .unwrap_or(Decimal::ZERO)
}
