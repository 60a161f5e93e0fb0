//! Outgoing calls: HMAC-signed gateway requests and bearer-token requests.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::canonical::{Body, CanonicalRequest, QueryValue, SIGNATURE_HEADER};
use crate::config::GatewayConfig;
use crate::error::{AuthError, Result};
use crate::handshake::HandshakeTransport;
use crate::token::TokenManager;

pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const AUTH_VERSION_HEADER: &str = "x-authentication-version";
pub const AUTH_TYPE_HEADER: &str = "x-authentication-type";
pub const SIGNATURE_METHOD_HEADER: &str = "x-signature-method";
pub const ACCESS_KEY_HEADER: &str = "x-isv-ak";

pub use reqwest::{Client as HttpClient, Method};

pub type QueryParams = BTreeMap<String, QueryValue>;

/// Collects `(name, value)` pairs; a repeated name becomes a multi-valued parameter.
pub fn query_from_pairs(
    pairs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
) -> QueryParams {
    let mut query = QueryParams::new();
    for (name, value) in pairs {
        let (name, value) = (name.into(), value.into());
        let merged = match query.remove(&name) {
            None => QueryValue::Single(value),
            Some(QueryValue::Single(first)) => QueryValue::Multi(vec![first, value]),
            Some(QueryValue::Multi(mut values)) => {
                values.push(value);
                QueryValue::Multi(values)
            }
        };
        query.insert(name, merged);
    }
    query
}

/// Produces the identity and signature headers for gateway requests.
pub struct GatewaySigner {
    config: GatewayConfig,
    shared_secret: RwLock<String>,
}

impl GatewaySigner {
    pub fn new(config: GatewayConfig, shared_secret: impl Into<String>) -> Result<Self> {
        let shared_secret = checked_secret(shared_secret.into())?;
        if config.access_key_id.trim().is_empty() {
            return Err(AuthError::Config("gateway access key id is empty".into()));
        }
        config.url("/")?;
        Ok(Self {
            config,
            shared_secret: RwLock::new(shared_secret),
        })
    }

    /// Replaces the shared secret used for every later request. A blank
    /// secret is rejected and the current one kept.
    pub fn set_shared_secret(&self, shared_secret: impl Into<String>) -> Result<()> {
        let shared_secret = checked_secret(shared_secret.into())?;
        *self
            .shared_secret
            .write()
            .unwrap_or_else(PoisonError::into_inner) = shared_secret;
        info!(access_key_id = %self.config.access_key_id, "rotated gateway shared secret");
        Ok(())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Headers that are both sent and signed. The tenant header is omitted when blank.
    pub fn identity_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        if let Some(tenant) = self.config.tenant_id.as_deref().filter(|t| !t.trim().is_empty()) {
            headers.insert(TENANT_ID_HEADER.to_string(), tenant.to_string());
        }
        headers.insert(
            AUTH_VERSION_HEADER.to_string(),
            self.config.authentication_version.clone(),
        );
        headers.insert(
            AUTH_TYPE_HEADER.to_string(),
            self.config.authentication_type.clone(),
        );
        headers.insert(
            SIGNATURE_METHOD_HEADER.to_string(),
            self.config.signature_method.clone(),
        );
        headers.insert(
            ACCESS_KEY_HEADER.to_string(),
            self.config.access_key_id.clone(),
        );
        headers
    }

    /// Identity headers plus `x-signature` for this request.
    pub fn signed_headers(
        &self,
        path: &str,
        query: &QueryParams,
        body: &Body,
    ) -> Result<BTreeMap<String, String>> {
        let mut headers = self.identity_headers();
        let canonical = CanonicalRequest::build(path, &headers, query, body)?;
        let signature = {
            let secret = self
                .shared_secret
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            canonical.sign(&secret)?
        };
        headers.insert(SIGNATURE_HEADER.to_string(), signature);
        Ok(headers)
    }
}

fn checked_secret(shared_secret: String) -> Result<String> {
    if shared_secret.trim().is_empty() {
        return Err(AuthError::Signature("shared secret is empty".into()));
    }
    Ok(shared_secret)
}

/// HTTP client for the canonical-signing gateway.
pub struct GatewayClient {
    signer: GatewaySigner,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, shared_secret: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self::with_client(
            GatewaySigner::new(config, shared_secret)?,
            client,
        ))
    }

    pub fn with_client(signer: GatewaySigner, client: reqwest::Client) -> Self {
        Self { signer, client }
    }

    pub fn signer(&self) -> &GatewaySigner {
        &self.signer
    }

    pub fn set_shared_secret(&self, shared_secret: impl Into<String>) -> Result<()> {
        self.signer.set_shared_secret(shared_secret)
    }

    pub async fn get(&self, path: &str, query: &QueryParams) -> Result<Value> {
        self.send(Method::GET, path, query, Body::Empty).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Value> {
        self.send(Method::POST, path, &QueryParams::new(), Body::json(body)?)
            .await
    }

    /// Signs and sends one request. The body bytes sent are exactly the bytes signed.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &QueryParams,
        body: Body,
    ) -> Result<Value> {
        let url = self.signer.config().url(path)?;
        let headers = self.signer.signed_headers(path, query, &body)?;

        let wire_query: Vec<(&str, &str)> = query
            .iter()
            .flat_map(|(key, value)| {
                value
                    .values()
                    .into_iter()
                    .map(move |v| (key.as_str(), v))
            })
            .collect();

        debug!(%method, %url, "sending signed gateway request");
        let mut request = self.client.request(method, &url).query(&wire_query);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let request = attach_body(request, body);

        read_json(request.send().await?).await
    }
}

fn attach_body(request: RequestBuilder, body: Body) -> RequestBuilder {
    match body {
        Body::Empty => request,
        Body::Json(text) => request.header(CONTENT_TYPE, "application/json").body(text),
        Body::Text(text) => request
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(text),
        Body::Bytes(bytes) => request
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes),
    }
}

async fn read_json(response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(AuthError::Gateway {
            status: status.as_u16(),
            message: text,
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Sends a JSON request authorized with a bearer token from `tokens`.
///
/// A `401` is treated as a stale token: it is invalidated and the request is
/// retried once with a freshly negotiated token.
pub async fn send_with_bearer<T: HandshakeTransport>(
    client: &reqwest::Client,
    tokens: &TokenManager<T>,
    method: Method,
    url: &str,
    body: Option<&Value>,
) -> Result<Value> {
    tokens
        .run_with_token(|token| {
            let mut request = client
                .request(method.clone(), url)
                .header(AUTHORIZATION, format!("Bearer {token}"));
            if let Some(body) = body {
                request = request.json(body);
            }
            async move {
                let response = request.send().await?;
                if response.status() == StatusCode::UNAUTHORIZED {
                    return Err(AuthError::TokenExpiredDownstream);
                }
                read_json(response).await
            }
        })
        .await
}
