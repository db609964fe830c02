//! HMAC-SHA256 delivery signatures.
//!
//! The signed message is `"{timestamp}.{body}"`; the header value is
//! `sha256=<lowercase hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

fn mac(secret: &str, timestamp: i64, body: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac
}

/// Header value for `X-Escrow-Signature`.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let tag = mac(secret, timestamp, body).finalize().into_bytes();
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(tag))
}

/// Constant-time check of a received `X-Escrow-Signature` header.
pub fn verify(secret: &str, timestamp: i64, body: &str, header: &str) -> bool {
    let Some(encoded) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(tag) = hex::decode(encoded) else {
        return false;
    };
    mac(secret, timestamp, body).verify_slice(&tag).is_ok()
}
