use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let expected = compute_hmac_sha256_hex(secret, payload);
    let provided = normalize_signature(signature_header);
    constant_time_hex_equals(&provided, &expected)
}

pub fn compute_hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts variable-length keys");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn normalize_signature(raw: &str) -> String {
    raw.trim()
        .strip_prefix("sha256=")
        .unwrap_or(raw.trim())
        .chars()
        .filter(|character| !character.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn constant_time_hex_equals(left: &str, right: &str) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.as_bytes().ct_eq(right.as_bytes()).into()
}
