use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::Sha256;

use super::encoding::{base64_to_hex, encode_base64};
use super::signer::PayloadSigner;
use crate::error::{AuthError, Result};
use crate::keys::{KeyMaterial, ensure_pem};

/// RSA PKCS#1 v1.5 signer with SHA-256 digest.
///
/// Signs the handshake proof `identity || timestamp_ms`.
pub struct RsaSigner {
    signing_key: SigningKey<Sha256>,
}

impl RsaSigner {
    /// Imports a PKCS#8 (`PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) key.
    ///
    /// Un-delimited Base64 is accepted as PKCS#8. Line width inside the PEM
    /// body does not matter.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pem = ensure_pem(pem);
        let body: String = pem
            .lines()
            .filter(|line| !line.trim_start().starts_with("-----"))
            .flat_map(|line| line.chars().filter(|c| !c.is_whitespace()))
            .collect();
        let der = STANDARD
            .decode(body)
            .map_err(|e| AuthError::Signature(format!("private key is not valid base64: {e}")))?;

        let private_key = if pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_der(&der)
                .map_err(|e| AuthError::Signature(format!("parsing PKCS#1 private key: {e}")))?
        } else {
            RsaPrivateKey::from_pkcs8_der(&der)
                .map_err(|e| AuthError::Signature(format!("parsing PKCS#8 private key: {e}")))?
        };

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    pub fn from_key_material(key: &KeyMaterial) -> Result<Self> {
        Self::from_pem(key.private_key())
    }

    /// Base64 signature over `identity` immediately followed by the decimal timestamp.
    pub fn sign_identity(&self, identity: &str, timestamp_ms: u64) -> Result<String> {
        let message = format!("{identity}{timestamp_ms}");
        let signature = PayloadSigner::sign(self, message.as_bytes())?;
        Ok(encode_base64(&signature))
    }

    /// Hex form of [`sign_identity`](Self::sign_identity), as sent to the handshake endpoint.
    pub fn handshake_secret(&self, identity: &str, timestamp_ms: u64) -> Result<String> {
        base64_to_hex(&self.sign_identity(identity, timestamp_ms)?)
    }
}

impl PayloadSigner for RsaSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| AuthError::Signature(format!("rsa signing failed: {e}")))?;
        Ok(signature.to_vec())
    }

    fn algorithm(&self) -> &str {
        "rsa-pkcs1v15-sha256"
    }
}

/// Signs the handshake proof with the private key held in `key`.
pub fn sign_handshake(identity: &str, timestamp_ms: u64, key: &KeyMaterial) -> Result<String> {
    RsaSigner::from_key_material(key)?.sign_identity(identity, timestamp_ms)
}

/// `hex(base64decode(sign_handshake(..)))`.
pub fn handshake_secret(identity: &str, timestamp_ms: u64, key: &KeyMaterial) -> Result<String> {
    base64_to_hex(&sign_handshake(identity, timestamp_ms, key)?)
}
