//! Signature primitives used by the gateway adapters

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Hex HMAC-SHA256 of `data`
pub fn hmac_sha256_hex(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take any size key");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Hex HMAC-SHA512 of `data`
pub fn hmac_sha512_hex(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC can take any size key");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Concatenate `key+value` pairs sorted by key, skipping `exclude`
pub fn sorted_concat<'a, I>(params: I, exclude: &str) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let sorted: BTreeMap<&str, &str> = params
        .into_iter()
        .filter(|(k, _)| *k != exclude)
        .collect();
    sorted
        .into_iter()
        .fold(String::new(), |mut acc, (k, v)| {
            acc.push_str(k);
            acc.push_str(v);
            acc
        })
}

/// Sign a parameter set: HMAC-SHA256 over the sorted `key+value` concatenation
pub fn sign_params<'a, I>(secret: &[u8], params: I, signature_field: &str) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    hmac_sha256_hex(secret, sorted_concat(params, signature_field).as_bytes())
}

/// Verify a hex signature in constant time, ignoring hex case
pub fn verify_hex(expected: &str, provided: &str) -> bool {
    constant_time_compare(&expected.to_ascii_lowercase(), &provided.trim().to_ascii_lowercase())
}

/// Split a `ts=...,v1=...` style header into its parts
pub fn parse_signature_header(header: &str) -> BTreeMap<String, String> {
    header
        .split(',')
        .filter_map(|part| {
            let mut kv = part.splitn(2, '=');
            let key = kv.next()?.trim();
            let value = kv.next()?.trim();
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Constant-time string comparison to prevent timing attacks
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
