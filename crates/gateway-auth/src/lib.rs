pub mod canonical;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod keys;
pub mod signing;
pub mod token;

pub use canonical::{Body, CanonicalRequest, QueryValue, SIGNATURE_HEADER, sign_request};
pub use config::{GatewayConfig, HandshakeConfig, TokenConfig};
pub use error::{AuthError, Result};
pub use gateway::{GatewayClient, GatewaySigner, QueryParams, query_from_pairs, send_with_bearer};
pub use handshake::{HandshakeRequest, HandshakeResponse, HandshakeTransport, HttpHandshake};
pub use keys::{Env, KeyConfig, KeyMaterial, KeySource, ProcessEnv, StaticEnv};
pub use signing::{HmacSigner, PayloadSigner, RsaSigner, base64_to_hex, handshake_secret, sign_handshake};
pub use token::{CachedToken, TokenManager, TokenState};
