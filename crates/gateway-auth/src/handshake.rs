//! The token handshake call.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::HandshakeConfig;
use crate::error::{AuthError, Result};

/// Body of the handshake POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(rename = "accessId")]
    pub identity: String,
    /// Decimal milliseconds since the Unix epoch.
    pub time: String,
    /// Hex-encoded RSA signature over `identity || time`.
    pub secret: String,
}

/// Handshake response envelope. Only `success` and `data` are required by the
/// protocol; everything else is informational.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(default)]
    pub success: Value,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Server-supplied token lifetime in seconds, when present.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl HandshakeResponse {
    pub fn is_success(&self) -> bool {
        is_truthy(&self.success)
    }

    /// The bearer token, if the response is a success carrying a non-empty string.
    pub fn token(&self) -> Option<&str> {
        if !self.is_success() {
            return None;
        }
        self.data.as_str().filter(|token| !token.is_empty())
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
        Value::Null => false,
    }
}

/// Sends a handshake request and returns the parsed response.
///
/// Every failure, including a non-success HTTP status, is reported as
/// [`AuthError::Handshake`] or [`AuthError::Http`].
#[async_trait]
pub trait HandshakeTransport: Send + Sync {
    async fn shake_hand(&self, request: &HandshakeRequest) -> Result<HandshakeResponse>;
}

/// Handshake over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpHandshake {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpHandshake {
    pub fn new(config: &HandshakeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self::with_client(client, config.endpoint()?))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl HandshakeTransport for HttpHandshake {
    async fn shake_hand(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json;charset=UTF-8"),
            )
            .json(request)
            .send()
            .await?;

        let status = response.status();
        debug!(endpoint = %self.endpoint, status = status.as_u16(), "handshake response");
        if !status.is_success() {
            return Err(AuthError::Handshake(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| AuthError::Handshake(format!("unparseable handshake response: {e}")))
    }
}
