use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{AuthError, Result};

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes a Base64 signature and re-encodes the raw bytes as lowercase hex.
///
/// The handshake endpoint expects this form of the signature as its secret.
pub fn base64_to_hex(signature: &str) -> Result<String> {
    let raw = STANDARD
        .decode(signature.trim())
        .map_err(|e| AuthError::Signature(format!("signature is not valid base64: {e}")))?;
    Ok(hex::encode(raw))
}
