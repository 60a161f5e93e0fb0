//! Bearer token lifecycle.
//!
//! [`TokenManager`] holds a single cache slot that is either ABSENT or VALID.
//! Reads of a VALID slot never touch the network. Refreshes are serialized by
//! an async mutex so concurrent callers share one in-flight handshake:
//!
//! ```text
//! get_token(force)
//!   ├─ slot VALID and !force ──────────────────────────────► token
//!   └─ wait for refresh lock
//!        ├─ another caller finished an attempt meanwhile
//!        │     ├─ it installed a token ─────────────────────► token
//!        │     ├─ it could not sign ────────────────────────► Err
//!        │     └─ it failed otherwise ──────────────────────► None
//!        └─ sign identity||now, POST handshake, install/clear ► token | None
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{HandshakeConfig, MAX_TOKEN_LIFETIME, TokenConfig};
use crate::error::{AuthError, Result};
use crate::handshake::{HandshakeRequest, HandshakeResponse, HandshakeTransport, HttpHandshake};
use crate::keys::KeyMaterial;
use crate::signing::RsaSigner;

/// A token and the instant after which it must not be served.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl std::fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Absent,
    Valid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    NoToken,
    Signature(String),
}

#[derive(Debug, Default)]
struct Slot {
    token: Option<CachedToken>,
    /// Completed handshake attempts, successful or not.
    attempts: u64,
    last_failure: Option<Failure>,
}

impl Slot {
    fn valid_token(&self, now: Instant) -> Option<String> {
        self.token
            .as_ref()
            .filter(|token| token.is_valid_at(now))
            .map(|token| token.value.clone())
    }

    /// Outcome of the attempts completed since `observed_attempts`, if any.
    fn settled_since(
        &self,
        observed_attempts: u64,
        now: Instant,
    ) -> Option<Result<Option<String>>> {
        if self.attempts == observed_attempts {
            return None;
        }
        if let Some(token) = self.valid_token(now) {
            return Some(Ok(Some(token)));
        }
        match &self.last_failure {
            Some(Failure::NoToken) => Some(Ok(None)),
            Some(Failure::Signature(reason)) => {
                Some(Err(AuthError::Signature(reason.clone())))
            }
            None => None,
        }
    }
}

/// Single-slot bearer token cache backed by the RSA handshake.
pub struct TokenManager<T> {
    config: TokenConfig,
    signer: RwLock<Arc<RsaSigner>>,
    transport: T,
    slot: Mutex<Slot>,
    refresh: tokio::sync::Mutex<()>,
}

impl TokenManager<HttpHandshake> {
    /// Manager that performs the handshake over HTTP.
    pub fn from_config(
        config: TokenConfig,
        handshake: &HandshakeConfig,
        key: &KeyMaterial,
    ) -> Result<Self> {
        let transport = HttpHandshake::new(handshake)?;
        Self::new(config, RsaSigner::from_key_material(key)?, transport)
    }
}

impl<T: HandshakeTransport> TokenManager<T> {
    pub fn new(config: TokenConfig, signer: RsaSigner, transport: T) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            signer: RwLock::new(Arc::new(signer)),
            transport,
            slot: Mutex::new(Slot::default()),
            refresh: tokio::sync::Mutex::new(()),
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the cached token, performing a handshake when the slot is
    /// ABSENT, expired, or `force_refresh` is set.
    ///
    /// `Ok(None)` means authentication did not succeed (network error,
    /// non-success response, unusable payload); the caller may retry later.
    /// Errors are reserved for signing failures, which indicate
    /// misconfiguration.
    pub async fn get_token(&self, force_refresh: bool) -> Result<Option<String>> {
        let observed_attempts = {
            let slot = self.lock_slot();
            if !force_refresh {
                if let Some(token) = slot.valid_token(Instant::now()) {
                    return Ok(Some(token));
                }
            }
            slot.attempts
        };

        let _refresh = self.refresh.lock().await;

        let settled = self
            .lock_slot()
            .settled_since(observed_attempts, Instant::now());
        if let Some(outcome) = settled {
            return outcome;
        }

        self.handshake().await
    }

    /// Discards any cached token; the next [`get_token`](Self::get_token) performs a handshake.
    pub fn invalidate_token(&self) {
        self.lock_slot().token = None;
    }

    /// Replaces the signing key and drops the token obtained with the old one.
    pub fn set_signer(&self, signer: RsaSigner) {
        *self.signer.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(signer);
        self.invalidate_token();
    }

    pub fn state(&self) -> TokenState {
        match self.lock_slot().valid_token(Instant::now()) {
            Some(_) => TokenState::Valid,
            None => TokenState::Absent,
        }
    }

    pub fn cached_token(&self) -> Option<CachedToken> {
        self.lock_slot().token.clone()
    }

    /// Runs `op` with a token. If `op` reports the token was rejected
    /// downstream, invalidates it and retries once with a fresh token.
    pub async fn run_with_token<F, Fut, R>(&self, mut op: F) -> Result<R>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let token = self.require_token(false).await?;
        match op(token).await {
            Err(AuthError::TokenExpiredDownstream) => {
                warn!(identity = %self.config.identity, "token rejected downstream, refreshing");
                self.invalidate_token();
                let token = self.require_token(true).await?;
                op(token).await
            }
            other => other,
        }
    }

    async fn require_token(&self, force_refresh: bool) -> Result<String> {
        self.get_token(force_refresh)
            .await?
            .ok_or_else(|| AuthError::Handshake("no token available".into()))
    }

    async fn handshake(&self) -> Result<Option<String>> {
        let now = Instant::now();
        let timestamp_ms = unix_millis();
        let signer = self.current_signer();

        let secret = match signer.handshake_secret(&self.config.identity, timestamp_ms) {
            Ok(secret) => secret,
            Err(e) => {
                let reason = match &e {
                    AuthError::Signature(reason) => reason.clone(),
                    other => other.to_string(),
                };
                self.record_failure(Failure::Signature(reason));
                return Err(e);
            }
        };
        let request = HandshakeRequest {
            identity: self.config.identity.clone(),
            time: timestamp_ms.to_string(),
            secret,
        };

        let response = match self.transport.shake_hand(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(identity = %self.config.identity, error = %e, "handshake failed");
                self.record_failure(Failure::NoToken);
                return Ok(None);
            }
        };

        let Some(token) = response.token() else {
            warn!(
                identity = %self.config.identity,
                code = ?response.code,
                message = ?response.message,
                "handshake returned no token"
            );
            self.record_failure(Failure::NoToken);
            return Ok(None);
        };

        let lifetime = self.lifetime(&response);
        let Some(expires_at) = now.checked_add(lifetime) else {
            warn!(
                identity = %self.config.identity,
                lifetime_secs = lifetime.as_secs(),
                "token lifetime out of range"
            );
            self.record_failure(Failure::NoToken);
            return Ok(None);
        };
        let token = token.to_string();
        {
            let mut slot = self.lock_slot();
            slot.token = Some(CachedToken {
                value: token.clone(),
                expires_at,
            });
            slot.attempts += 1;
            slot.last_failure = None;
        }
        info!(
            identity = %self.config.identity,
            lifetime_secs = lifetime.as_secs(),
            "installed bearer token"
        );
        Ok(Some(token))
    }

    fn lifetime(&self, response: &HandshakeResponse) -> Duration {
        match response.expires_in {
            Some(secs) if secs > 0 => Duration::from_secs(secs).min(MAX_TOKEN_LIFETIME),
            _ => self.config.validity_window(),
        }
    }

    fn record_failure(&self, failure: Failure) {
        let mut slot = self.lock_slot();
        slot.token = None;
        slot.attempts += 1;
        slot.last_failure = Some(failure);
    }

    fn current_signer(&self) -> Arc<RsaSigner> {
        self.signer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PKCS8_PEM: &str = include_str!("../tests/fixtures/handshake_key.pem");

    enum Reply {
        Token(&'static str),
        TokenWithExpiry(&'static str, u64),
        Rejected,
        NetworkError,
    }

    /// Scripted transport; replays `replies` in order and repeats the last one.
    struct MockHandshake {
        calls: AtomicUsize,
        replies: Mutex<VecDeque<Reply>>,
        delay: Duration,
        requests: Mutex<Vec<HandshakeRequest>>,
    }

    impl MockHandshake {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                replies: Mutex::new(replies.into()),
                delay: Duration::ZERO,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HandshakeTransport for MockHandshake {
        async fn shake_hand(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.len() > 1 {
                    replies.pop_front().unwrap()
                } else {
                    match replies.front().unwrap() {
                        Reply::Token(t) => Reply::Token(*t),
                        Reply::TokenWithExpiry(t, s) => Reply::TokenWithExpiry(*t, *s),
                        Reply::Rejected => Reply::Rejected,
                        Reply::NetworkError => Reply::NetworkError,
                    }
                }
            };
            let body = match reply {
                Reply::Token(t) => json!({"success": true, "data": format!("{t}-{n}")}),
                Reply::TokenWithExpiry(t, s) => {
                    json!({"success": true, "data": format!("{t}-{n}"), "expiresIn": s})
                }
                Reply::Rejected => json!({"success": false, "code": "DENIED"}),
                Reply::NetworkError => {
                    return Err(AuthError::Handshake("connection refused".into()));
                }
            };
            Ok(serde_json::from_value(body).unwrap())
        }
    }

    fn manager(replies: Vec<Reply>) -> TokenManager<MockHandshake> {
        manager_with(MockHandshake::new(replies))
    }

    fn manager_with(transport: MockHandshake) -> TokenManager<MockHandshake> {
        TokenManager::new(
            TokenConfig::new("tenant-A"),
            RsaSigner::from_pem(PKCS8_PEM).unwrap(),
            transport,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn second_call_hits_cache() {
        let manager = manager(vec![Reply::Token("tok")]);
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-0"));
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-0"));
        assert_eq!(manager.transport().calls(), 1);
        assert_eq!(manager.state(), TokenState::Valid);
    }

    #[tokio::test]
    async fn invalidate_forces_handshake() {
        let manager = manager(vec![Reply::Token("tok")]);
        manager.get_token(false).await.unwrap();
        manager.invalidate_token();
        assert_eq!(manager.state(), TokenState::Absent);
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-1"));
        assert_eq!(manager.transport().calls(), 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_valid_cache() {
        let manager = manager(vec![Reply::Token("tok")]);
        manager.get_token(false).await.unwrap();
        assert_eq!(manager.get_token(true).await.unwrap().as_deref(), Some("tok-1"));
        assert_eq!(manager.transport().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn token_expires_after_validity_window() {
        let manager = manager(vec![Reply::Token("tok")]);
        manager.get_token(false).await.unwrap();

        tokio::time::advance(Duration::from_secs(20 * 60 - 1)).await;
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-0"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(manager.state(), TokenState::Absent);
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-1"));
        assert_eq!(manager.transport().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_expiry_takes_precedence() {
        let manager = manager(vec![Reply::TokenWithExpiry("tok", 60)]);
        manager.get_token(false).await.unwrap();
        let token = manager.cached_token().unwrap();
        assert_eq!(token.expires_at() - Instant::now(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(manager.state(), TokenState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_server_expiry_is_capped() {
        let manager = manager(vec![Reply::TokenWithExpiry("tok", u64::MAX)]);
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-0"));
        let token = manager.cached_token().unwrap();
        assert_eq!(token.expires_at() - Instant::now(), MAX_TOKEN_LIFETIME);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_validity_window_is_honoured() {
        let manager = TokenManager::new(
            TokenConfig::new("tenant-A").with_validity_window(Duration::from_secs(90)),
            RsaSigner::from_pem(PKCS8_PEM).unwrap(),
            MockHandshake::new(vec![Reply::Token("tok")]),
        )
        .unwrap();
        manager.get_token(false).await.unwrap();

        tokio::time::advance(Duration::from_secs(89)).await;
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-0"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(manager.state(), TokenState::Absent);
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn waiters_replay_signing_failures() {
        let now = Instant::now();
        let slot = Slot {
            token: None,
            attempts: 1,
            last_failure: Some(Failure::Signature("bad key".into())),
        };
        assert!(slot.settled_since(1, now).is_none());
        match slot.settled_since(0, now) {
            Some(Err(AuthError::Signature(reason))) => assert_eq!(reason, "bad key"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let slot = Slot {
            last_failure: Some(Failure::NoToken),
            ..slot
        };
        assert!(matches!(slot.settled_since(0, now), Some(Ok(None))));
    }

    #[tokio::test]
    async fn rejected_handshake_yields_none() {
        let manager = manager(vec![Reply::Rejected]);
        assert_eq!(manager.get_token(false).await.unwrap(), None);
        assert_eq!(manager.state(), TokenState::Absent);
    }

    #[tokio::test]
    async fn network_error_yields_none_and_clears_cache() {
        let manager = manager(vec![Reply::Token("tok"), Reply::NetworkError]);
        manager.get_token(false).await.unwrap();
        assert_eq!(manager.get_token(true).await.unwrap(), None);
        assert_eq!(manager.cached_token(), None);
    }

    #[tokio::test]
    async fn failure_then_success_recovers() {
        let manager = manager(vec![Reply::NetworkError, Reply::Token("tok")]);
        assert_eq!(manager.get_token(false).await.unwrap(), None);
        assert_eq!(manager.get_token(false).await.unwrap().as_deref(), Some("tok-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_handshake() {
        let transport = MockHandshake::new(vec![Reply::Token("tok")])
            .with_delay(Duration::from_millis(50));
        let manager = manager_with(transport);

        let (a, b, c) = tokio::join!(
            manager.get_token(false),
            manager.get_token(false),
            manager.get_token(false),
        );
        assert_eq!(a.unwrap().as_deref(), Some("tok-0"));
        assert_eq!(b.unwrap().as_deref(), Some("tok-0"));
        assert_eq!(c.unwrap().as_deref(), Some("tok-0"));
        assert_eq!(manager.transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_a_failure() {
        let transport =
            MockHandshake::new(vec![Reply::Rejected]).with_delay(Duration::from_millis(50));
        let manager = manager_with(transport);

        let (a, b) = tokio::join!(manager.get_token(false), manager.get_token(false));
        assert_eq!(a.unwrap(), None);
        assert_eq!(b.unwrap(), None);
        assert_eq!(manager.transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_forced_refreshes_coalesce() {
        let transport =
            MockHandshake::new(vec![Reply::Token("tok")]).with_delay(Duration::from_millis(50));
        let manager = manager_with(transport);
        manager.get_token(false).await.unwrap();

        let (a, b) = tokio::join!(manager.get_token(true), manager.get_token(true));
        assert_eq!(a.unwrap().as_deref(), Some("tok-1"));
        assert_eq!(b.unwrap().as_deref(), Some("tok-1"));
        assert_eq!(manager.transport().calls(), 2);
    }

    #[tokio::test]
    async fn manager_is_shareable_across_tasks() {
        let manager = Arc::new(manager(vec![Reply::Token("tok")]));
        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_token(false).await })
        };
        assert_eq!(task.await.unwrap().unwrap().as_deref(), Some("tok-0"));
    }

    #[tokio::test]
    async fn request_carries_verifiable_secret() {
        use rsa::pkcs1v15::{Signature, VerifyingKey};
        use rsa::pkcs8::DecodePrivateKey;
        use rsa::signature::Verifier;

        let manager = manager(vec![Reply::Token("tok")]);
        manager.get_token(false).await.unwrap();

        let request = manager.transport().requests.lock().unwrap()[0].clone();
        assert_eq!(request.identity, "tenant-A");
        assert!(request.time.parse::<u64>().unwrap() > 1_600_000_000_000);

        let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(PKCS8_PEM).unwrap();
        let verifying_key = VerifyingKey::<sha2::Sha256>::new(private_key.to_public_key());
        let signature = Signature::try_from(hex::decode(&request.secret).unwrap().as_slice()).unwrap();
        let message = format!("{}{}", request.identity, request.time);
        verifying_key.verify(message.as_bytes(), &signature).unwrap();
    }

    #[tokio::test]
    async fn set_signer_invalidates_cache() {
        let manager = manager(vec![Reply::Token("tok")]);
        manager.get_token(false).await.unwrap();
        manager.set_signer(RsaSigner::from_pem(PKCS8_PEM).unwrap());
        assert_eq!(manager.state(), TokenState::Absent);
        manager.get_token(false).await.unwrap();
        assert_eq!(manager.transport().calls(), 2);
    }

    #[tokio::test]
    async fn run_with_token_retries_once_after_rejection() {
        let manager = manager(vec![Reply::Token("tok")]);
        let seen = Mutex::new(Vec::new());

        let result = manager
            .run_with_token(|token| {
                seen.lock().unwrap().push(token.clone());
                async move {
                    if token == "tok-0" {
                        Err(AuthError::TokenExpiredDownstream)
                    } else {
                        Ok(token)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "tok-1");
        assert_eq!(*seen.lock().unwrap(), vec!["tok-0", "tok-1"]);
    }

    #[tokio::test]
    async fn run_with_token_gives_up_after_second_rejection() {
        let manager = manager(vec![Reply::Token("tok")]);
        let result: Result<()> = manager
            .run_with_token(|_| async { Err(AuthError::TokenExpiredDownstream) })
            .await;
        assert!(matches!(result, Err(AuthError::TokenExpiredDownstream)));
        assert_eq!(manager.transport().calls(), 2);
    }

    #[tokio::test]
    async fn run_with_token_without_token_is_handshake_error() {
        let manager = manager(vec![Reply::Rejected]);
        let result: Result<()> = manager.run_with_token(|_| async { Ok(()) }).await;
        assert!(matches!(result, Err(AuthError::Handshake(_))));
    }

    #[test]
    fn zero_validity_window_rejected_at_construction() {
        let result = TokenManager::new(
            TokenConfig::new("tenant-A").with_validity_window(Duration::ZERO),
            RsaSigner::from_pem(PKCS8_PEM).unwrap(),
            MockHandshake::new(vec![Reply::Rejected]),
        );
        assert!(matches!(result, Err(AuthError::Config(_))));
    }

    #[test]
    fn empty_identity_rejected_at_construction() {
        let result = TokenManager::new(
            TokenConfig::new(" "),
            RsaSigner::from_pem(PKCS8_PEM).unwrap(),
            MockHandshake::new(vec![Reply::Rejected]),
        );
        assert!(matches!(result, Err(AuthError::Config(_))));
    }
}
