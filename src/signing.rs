use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::Webhook;

/// Signature headers attached to an outgoing dispatch, if the webhook has
/// a signing secret.
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub signature: Option<(String, String)>,
    pub timestamp: Option<(String, String)>,
}

/// Build signature and timestamp headers for a delivery payload.
///
/// The signature covers the timestamp concatenated with the payload as
/// sent on the wire, so batched bodies are signed as one unit.
pub fn build_signature_headers(webhook: &Webhook, payload: &[u8]) -> SignatureHeaders {
    let Some(secret) = webhook.secret.as_ref() else {
        return SignatureHeaders { signature: None, timestamp: None };
    };

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();

    let signature = compute_signature(secret, payload, Some(&timestamp));

    SignatureHeaders {
        signature: Some((webhook.signature_header.clone(), signature)),
        timestamp: Some((webhook.timestamp_header.clone(), timestamp)),
    }
}

/// Compute the HMAC-SHA256 signature for a delivery payload.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature with optional timestamp.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature_hex: &str,
) -> bool {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);

    mac.verify_slice(&signature).is_ok()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}
