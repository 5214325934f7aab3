//! Callback authentication helpers: HMAC-SHA256 body signatures.
//!
//! Callers that cannot hold the raw per-run secret in a header may instead
//! sign the request body with it and send the signature as
//! `X-Weft-Signature-256: sha256=<hex>`. Verification is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from signature verification.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// Signature did not match the body.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Invalid HMAC key.
    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),
}

// ---------------------------------------------------------------------------
// HMAC-SHA256 verification
// ---------------------------------------------------------------------------

/// Verify an HMAC-SHA256 signature against a request body.
///
/// Uses the hmac crate's constant-time `verify_slice`.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    signature_hex: &str,
) -> Result<(), SignatureError> {
    let expected_bytes =
        hex_decode(signature_hex).map_err(|_| SignatureError::VerificationFailed)?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected_bytes)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Verify a signature with an optional `sha256=` prefix.
pub fn verify_signature_with_prefix(
    secret: &[u8],
    body: &[u8],
    signature: &str,
) -> Result<(), SignatureError> {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_signature(secret, body, hex_sig)
}

/// Compute an HMAC-SHA256 signature as lowercase hex.
///
/// Useful for generating test vectors and caller-side signatures.
pub fn compute_signature_hex(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// hex helpers
// ---------------------------------------------------------------------------

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
