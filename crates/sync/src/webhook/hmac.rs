//! `X-Shopify-Hmac-Sha256` verification.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Check `header` (base64 HMAC-SHA256) against the exact request bytes.
///
/// Comparison is constant-time; undecodable or wrong-length signatures
/// simply fail.
#[must_use]
pub fn verify_hmac(body: &[u8], header: &str, secret: &str) -> bool {
    let Ok(provided) = STANDARD.decode(header.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// The header value Shopify would send for `body`.
#[must_use]
pub fn sign(body: &[u8], secret: &str) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "hush";
    const BODY: &[u8] = br#"{"id":1,"title":"Pineapple"}"#;

    #[test]
    fn test_matching_signature_passes() {
        let header = sign(BODY, SECRET);
        assert!(verify_hmac(BODY, &header, SECRET));
    }

    #[test]
    fn test_tampered_body_fails() {
        let header = sign(BODY, SECRET);
        assert!(!verify_hmac(br#"{"id":2,"title":"Pineapple"}"#, &header, SECRET));
    }

    #[test]
    fn test_truncated_signature_fails() {
        let header = sign(BODY, SECRET);
        assert!(!verify_hmac(BODY, &header[..header.len() - 4], SECRET));
        assert!(!verify_hmac(BODY, "", SECRET));
        assert!(!verify_hmac(BODY, "not base64!", SECRET));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let header = sign(BODY, "other");
        assert!(!verify_hmac(BODY, &header, SECRET));
    }
}
