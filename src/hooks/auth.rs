//! Run-task signature authentication.
//!
//! Terraform signs every run-task request body with HMAC-SHA512 using the
//! organization's HMAC key and sends the lowercase hex digest in the
//! `X-TFC-Task-Signature` header. The key lives in a secret store scoped to
//! the service's project; any failure to read it is treated as an
//! authentication failure.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use tracing::{debug, error, warn};

use crate::gcp::{GcpCredentials, SecretStore};

/// Default header carrying the body signature.
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-TFC-Task-Signature";

type HmacSha512 = Hmac<Sha512>;

/// Extract the signature from the request headers.
pub fn extract_signature<'a>(headers: &'a HeaderMap, header_name: &str) -> Option<&'a str> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Compute the lowercase hex HMAC-SHA512 of `body` keyed with `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = match HmacSha512::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of two strings.
///
/// Length is not secret here: every valid signature is 128 hex characters.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify `signature` against the HMAC-SHA512 of the raw `body`.
pub fn verify_signature(body: &[u8], signature: &str, secret: &[u8]) -> bool {
    if signature.is_empty() {
        return false;
    }
    let expected = compute_signature(secret, body);
    !expected.is_empty() && timing_safe_eq(&expected, signature)
}

/// Authenticate a raw request body against the key held in `store`.
///
/// Returns `false` when the signature is absent, the key cannot be read,
/// or the digests differ. Never returns an error.
pub async fn authenticate(
    body: &[u8],
    signature: Option<&str>,
    store: &dyn SecretStore,
    project_number: &str,
    creds: &GcpCredentials,
) -> bool {
    let Some(signature) = signature else {
        warn!(target: "auth", "missing run-task signature");
        return false;
    };

    let key = match store.hmac_key(project_number, creds).await {
        Ok(key) => key,
        Err(e) => {
            error!(target: "auth", "Error validating HMAC signature: {}", e);
            return false;
        }
    };

    let valid = verify_signature(body, signature, key.as_bytes());
    if !valid {
        debug!(target: "auth", "signature mismatch ({} body bytes)", body.len());
    }
    valid
}
