//! Provider callback authentication: base64 HMAC-SHA1 of the raw body, keyed
//! with the shared webhook secret.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::ServiceError;

pub const SIGNATURE_HEADER: &str = "x-anchor-signature";

type HmacSha1 = Hmac<Sha1>;

pub fn sign(secret: &str, payload: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::Unauthorized(format!("unusable webhook secret: {e}")))?;
    mac.update(payload);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Checks the signature before anything in the body is trusted. A missing
/// secret or header fails closed.
pub fn verify_signature(
    secret: Option<&str>,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<(), ServiceError> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized("webhook secret is not configured".to_string()))?;
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized("missing signature".to_string()))?;

    let expected = sign(secret, payload)?;
    if !constant_time_eq::constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        return Err(ServiceError::Unauthorized(
            "signature does not match".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"data":{"id":"evt_1","type":"customer.identification.approved"}}"#;

    #[test]
    fn accepts_matching_signature() {
        let signature = sign("s3cret", BODY).unwrap();
        assert!(verify_signature(Some("s3cret"), BODY, Some(&signature)).is_ok());
    }

    #[test]
    fn rejects_tampered_body() {
        let signature = sign("s3cret", BODY).unwrap();
        let tampered = br#"{"data":{"id":"evt_1","type":"customer.identification.rejected"}}"#;

        assert!(matches!(
            verify_signature(Some("s3cret"), tampered, Some(&signature)),
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[test]
    fn missing_secret_or_header_fails_closed() {
        let signature = sign("s3cret", BODY).unwrap();

        assert!(verify_signature(None, BODY, Some(&signature)).is_err());
        assert!(verify_signature(Some(""), BODY, Some(&signature)).is_err());
        assert!(verify_signature(Some("s3cret"), BODY, None).is_err());
    }

    #[test]
    fn known_vector() {
        // HMAC-SHA1("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign("key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(signature, "3nybhbi3iqa8ino29wqQcBydtNk=");
    }
}
