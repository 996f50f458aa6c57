//! Webhook signature verification: `stripe-signature` carries a timestamp
//! and one or more `v1` HMAC-SHA256 signatures over `"{t}.{body}"`.
//! Comparison is constant-time via the MAC verifier.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    MissingTimestamp,
    MissingSignature,
    TimestampOutOfTolerance,
    Mismatch,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::MissingTimestamp => write!(f, "signature header has no timestamp"),
            SignatureError::MissingSignature => write!(f, "signature header has no v1 signature"),
            SignatureError::TimestampOutOfTolerance => {
                write!(f, "signature timestamp outside tolerance")
            }
            SignatureError::Mismatch => write!(f, "signature does not match payload"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Verifies `header` against `payload`. `now_epoch` is injected so the
/// check is deterministic under test.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    signing_secret: &str,
    tolerance_secs: i64,
    now_epoch: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                if let Ok(decoded) = hex::decode(value) {
                    candidates.push(decoded);
                }
            }
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return Err(SignatureError::MissingTimestamp);
    };
    if candidates.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    if (now_epoch - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::TimestampOutOfTolerance);
    }

    for candidate in &candidates {
        let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let now = 1_760_000_000;
        let header = format!("t={},v1={}", now, sign(payload, SECRET, now));
        assert!(verify_signature(payload, &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let now = 1_760_000_000;
        let header = format!("t={},v1={}", now, sign(payload, "wrong", now));
        assert_eq!(
            verify_signature(payload, &header, SECRET, 300, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn modified_payload_fails() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let tampered = br#"{"type":"checkout.session.completed","x":1}"#;
        let now = 1_760_000_000;
        let header = format!("t={},v1={}", now, sign(payload, SECRET, now));
        assert_eq!(
            verify_signature(tampered, &header, SECRET, 300, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn old_timestamp_fails() {
        let payload = b"{}";
        let now = 1_760_000_000;
        let stamped = now - 600;
        let header = format!("t={},v1={}", stamped, sign(payload, SECRET, stamped));
        assert_eq!(
            verify_signature(payload, &header, SECRET, 300, now),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn one_matching_v1_among_many_passes() {
        let payload = b"{}";
        let now = 1_760_000_000;
        let header = format!(
            "t={},v1={},v1={}",
            now,
            sign(payload, "rotated-out", now),
            sign(payload, SECRET, now)
        );
        assert!(verify_signature(payload, &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn malformed_headers_fail_closed() {
        let payload = b"{}";
        let now = 1_760_000_000;
        assert_eq!(
            verify_signature(payload, "v1=deadbeef", SECRET, 300, now),
            Err(SignatureError::MissingTimestamp)
        );
        assert_eq!(
            verify_signature(payload, &format!("t={}", now), SECRET, 300, now),
            Err(SignatureError::MissingSignature)
        );
        assert_eq!(
            verify_signature(payload, &format!("t={},v1=zz", now), SECRET, 300, now),
            Err(SignatureError::MissingSignature)
        );
    }
}
