use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a provider signature header against the raw body.
///
/// Accepts bare hex or a `sha256=` prefixed value, case-insensitively.
pub fn verify_signature(secret: &str, payload: &[u8], provided: &str) -> bool {
    let provided = provided.trim();
    let provided = provided
        .strip_prefix("sha256=")
        .unwrap_or(provided)
        .to_ascii_lowercase();
    let expected = sign_payload(secret, payload);
    if expected.is_empty() {
        return false;
    }
    ConstantTimeEq::ct_eq(provided.as_bytes(), expected.as_bytes()).into()
}
