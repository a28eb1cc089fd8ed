//! HMAC-SHA256 webhook signatures.
//!
//! The gateway signs the raw request body with the shared secret and sends
//! `sha256=<hex digest>` in [`SIGNATURE_HEADER`].

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{GatewayError, Result};

pub const SIGNATURE_HEADER: &str = "x-recado-signature";

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret: &str, body: &[u8]) -> Result<HmacSha256> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| GatewayError::BadSignature)?;
    mac.update(body);
    Ok(mac)
}

pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mac = keyed(secret, body)?;
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Verifies `header` against the body in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
    let header = header.ok_or(GatewayError::MissingSignature)?.trim();
    let digest = header.strip_prefix("sha256=").unwrap_or(header);
    let expected = hex::decode(digest).map_err(|_| GatewayError::BadSignature)?;

    keyed(secret, body)?
        .verify_slice(&expected)
        .map_err(|_| GatewayError::BadSignature)
}
