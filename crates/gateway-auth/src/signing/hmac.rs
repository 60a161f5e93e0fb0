use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::signer::PayloadSigner;
use crate::error::{AuthError, Result};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 keyed with the gateway shared secret.
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(shared_secret: &str) -> Result<Self> {
        if shared_secret.trim().is_empty() {
            return Err(AuthError::Signature("shared secret is empty".into()));
        }
        Ok(Self {
            key: shared_secret.as_bytes().to_vec(),
        })
    }
}

impl PayloadSigner for HmacSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AuthError::Signature(format!("invalid HMAC key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn algorithm(&self) -> &str {
        "hmac-sha256"
    }
}
