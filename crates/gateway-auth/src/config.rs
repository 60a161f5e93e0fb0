use std::time::Duration;

use serde::Deserialize;

use crate::error::{AuthError, Result};

pub const DEFAULT_HANDSHAKE_PATH: &str = "/api/contract/shakeHand";

/// Token lifetime used when the handshake response carries no `expiresIn`.
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(20 * 60);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on any token lifetime, configured or server-supplied.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Where the token handshake is sent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub rest_url: String,
    pub handshake_path: String,
    pub timeout_secs: u64,
}

impl HandshakeConfig {
    pub fn new(rest_url: impl Into<String>) -> Self {
        Self {
            rest_url: rest_url.into(),
            ..Self::default()
        }
    }

    pub fn endpoint(&self) -> Result<String> {
        join_url(&self.rest_url, &self.handshake_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            rest_url: String::new(),
            handshake_path: DEFAULT_HANDSHAKE_PATH.to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

/// Token manager settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Access id presented in the handshake and signed with the timestamp.
    pub identity: String,
    pub validity_window_secs: u64,
}

impl TokenConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    pub fn with_validity_window(mut self, window: Duration) -> Self {
        self.validity_window_secs = window.as_secs();
        self
    }

    pub fn validity_window(&self) -> Duration {
        Duration::from_secs(self.validity_window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(AuthError::Config("token identity is empty".into()));
        }
        if self.validity_window_secs == 0 {
            return Err(AuthError::Config("token validity window is zero".into()));
        }
        if self.validity_window() > MAX_TOKEN_LIFETIME {
            return Err(AuthError::Config(format!(
                "token validity window exceeds {}s",
                MAX_TOKEN_LIFETIME.as_secs()
            )));
        }
        Ok(())
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            validity_window_secs: DEFAULT_TOKEN_VALIDITY.as_secs(),
        }
    }
}

/// The canonical-signing gateway and the identity headers it requires.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub tenant_id: Option<String>,
    pub access_key_id: String,
    pub authentication_version: String,
    pub authentication_type: String,
    pub signature_method: String,
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, access_key_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_key_id: access_key_id.into(),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// `base_url` joined with `path`. The base must not carry a path of its
    /// own, since only `path` is signed.
    pub fn url(&self, path: &str) -> Result<String> {
        let base = reqwest::Url::parse(self.base_url.trim()).map_err(|e| {
            AuthError::Config(format!("invalid gateway base url {:?}: {e}", self.base_url))
        })?;
        if base.path() != "/" {
            return Err(AuthError::Config(format!(
                "gateway base url must not carry a path, got {}",
                base.path()
            )));
        }
        join_url(&self.base_url, path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            tenant_id: None,
            access_key_id: String::new(),
            authentication_version: "1.0".to_string(),
            authentication_type: "isv".to_string(),
            signature_method: "SHA256_HMAC".to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

fn join_url(base: &str, path: &str) -> Result<String> {
    if base.trim().is_empty() {
        return Err(AuthError::Config("base url is empty".into()));
    }
    if !path.starts_with('/') {
        return Err(AuthError::Config(format!("path must start with '/': {path}")));
    }
    Ok(format!("{}{}", base.trim_end_matches('/'), path))
}
