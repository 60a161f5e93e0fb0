use crate::error::Result;

/// Trait for signing canonical bytes.
///
/// Implementations are synchronous and deterministic: identical input always
/// yields identical output.
pub trait PayloadSigner: Send + Sync {
    /// Sign canonical bytes. Returns raw signature bytes.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Algorithm identifier string (e.g. "rsa-pkcs1v15-sha256").
    fn algorithm(&self) -> &str;
}
