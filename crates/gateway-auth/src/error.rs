use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    #[error("Failed to load key material: {0}")]
    KeyLoad(String),
    #[error("Failed to read key file {path}: {reason}")]
    KeyFile { path: PathBuf, reason: String },
    #[error("Failed to compute signature: {0}")]
    Signature(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Token was rejected by the downstream service")]
    TokenExpiredDownstream,
    #[error("Gateway returned {status}: {message}")]
    Gateway { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether a later attempt may succeed without operator intervention.
    ///
    /// Key loading, signing and configuration failures are misconfiguration
    /// and must not be retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AuthError::Handshake(_)
            | AuthError::TokenExpiredDownstream
            | AuthError::Gateway { .. }
            | AuthError::Http(_) => true,
            AuthError::KeyLoad(_)
            | AuthError::KeyFile { .. }
            | AuthError::Signature(_)
            | AuthError::Config(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
