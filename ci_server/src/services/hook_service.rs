//! Hook ingestion — signature validation and payload parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::models::hook::HookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex hmac of the body>`.
pub const SIGNATURE_HEADER: &str = "x-sea-signature-256";

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook signature validation failed")]
    BadSignature,
    #[error("malformed hook payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Validate a hook signature (`sha256=<hex>`).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Signature header value for `payload`, as a hook script would compute it.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac takes any key size"));
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check the signature and decode the hook body.
pub fn parse_hook(
    secret: &str,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<HookEvent, HookError> {
    if !validate_signature(secret, payload, signature.unwrap_or_default()) {
        return Err(HookError::BadSignature);
    }
    Ok(serde_json::from_slice(payload)?)
}
