//! Canonical request signing for the HMAC gateway.
//!
//! The signable content is the plain concatenation
//! `path || headers || query || body`, where headers and query parameters are
//! rendered as `key=value` pairs joined by `&` in byte-wise key order. The
//! gateway recomputes the same bytes, so every step here is order- and
//! byte-exact.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{AuthError, Result};
use crate::signing::encoding::encode_base64;
use crate::signing::{HmacSigner, PayloadSigner};

/// Header carrying the computed signature. Never an input to canonicalization.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// A query parameter value; multi-valued parameters are joined with `,`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Single(String),
    Multi(Vec<String>),
}

impl QueryValue {
    fn joined(&self) -> String {
        match self {
            QueryValue::Single(value) => value.clone(),
            QueryValue::Multi(values) => values.join(","),
        }
    }

    /// Individual values as they appear on the wire.
    pub fn values(&self) -> Vec<&str> {
        match self {
            QueryValue::Single(value) => vec![value.as_str()],
            QueryValue::Multi(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Single(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Single(value)
    }
}

impl From<&String> for QueryValue {
    fn from(value: &String) -> Self {
        QueryValue::Single(value.clone())
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(values: Vec<String>) -> Self {
        QueryValue::Multi(values)
    }
}

impl From<Vec<&str>> for QueryValue {
    fn from(values: Vec<&str>) -> Self {
        QueryValue::Multi(values.into_iter().map(str::to_string).collect())
    }
}

impl From<&QueryValue> for QueryValue {
    fn from(value: &QueryValue) -> Self {
        value.clone()
    }
}

/// Request body as it will be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    /// Compact JSON text, produced by [`Body::json`].
    Json(String),
    Bytes(Vec<u8>),
}

impl Body {
    /// Serializes structured data to compact JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_string(value)
            .map(Body::Json)
            .map_err(|e| AuthError::Signature(format!("serializing request body: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Text(text) | Body::Json(text) => text.as_bytes(),
            Body::Bytes(bytes) => bytes,
        }
    }
}

/// The canonical form of one outgoing request. Built per call, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    path: String,
    headers: String,
    query: String,
    body: Vec<u8>,
}

impl CanonicalRequest {
    pub fn build(
        path: &str,
        headers: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        query: impl IntoIterator<Item = (impl Into<String>, impl Into<QueryValue>)>,
        body: &Body,
    ) -> Result<Self> {
        let headers: BTreeMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case(SIGNATURE_HEADER))
        {
            return Err(AuthError::Signature(format!(
                "{SIGNATURE_HEADER} must not be part of the signed headers"
            )));
        }

        let query: BTreeMap<String, String> = query
            .into_iter()
            .map(|(k, v)| (k.into(), v.into().joined()))
            .collect();

        Ok(Self {
            path: path.to_string(),
            headers: join_pairs(&headers),
            query: join_pairs(&query),
            body: body.as_bytes().to_vec(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn header_string(&self) -> &str {
        &self.headers
    }

    pub fn query_string(&self) -> &str {
        &self.query
    }

    /// The exact bytes the MAC is computed over.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(
            self.path.len() + self.headers.len() + self.query.len() + self.body.len(),
        );
        content.extend_from_slice(self.path.as_bytes());
        content.extend_from_slice(self.headers.as_bytes());
        content.extend_from_slice(self.query.as_bytes());
        content.extend_from_slice(&self.body);
        content
    }

    /// Base64 HMAC-SHA256 of [`to_bytes`](Self::to_bytes).
    pub fn sign(&self, shared_secret: &str) -> Result<String> {
        let signer = HmacSigner::new(shared_secret)?;
        debug!(
            path = %self.path,
            header_len = self.headers.len(),
            query_len = self.query.len(),
            body_len = self.body.len(),
            "signing canonical request"
        );
        let mac = signer.sign(&self.to_bytes())?;
        Ok(encode_base64(&mac))
    }
}

fn join_pairs(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonicalizes and signs in one step.
pub fn sign_request(
    path: &str,
    headers: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    query: impl IntoIterator<Item = (impl Into<String>, impl Into<QueryValue>)>,
    body: &Body,
    shared_secret: &str,
) -> Result<String> {
    CanonicalRequest::build(path, headers, query, body)?.sign(shared_secret)
}
