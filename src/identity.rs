//! Identity provider abstraction and its implementations.
//!
//! The handshake, refresh loop and request wrapper all talk to an
//! [`IdentityProvider`] instead of branching on a mock flag. Composition
//! picks one of two implementations:
//!
//! * [`HttpIdentityProvider`] - the live identity backend
//! * [`FakeIdentityProvider`] - deterministic in-memory provider for demo
//!   mode and tests

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::{
    config::Config,
    http,
    protocol::{
        self,
        identity::{AuthenticateData, AuthenticateRequest, AuthorizeData, RefreshData, UserInfo},
        Envelope,
    },
    tokens::{AccessToken, RefreshToken},
    uuid::Uuid,
};

/// Failures of the identity and profile flows.
///
/// Handshake-stage failures surface to the user; profile sync is absorbed;
/// refresh failures are deferred until the next 401. Nothing here is fatal
/// to the process.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Backend unreachable. Surfaced with a retry affordance; the caller
    /// must not redirect.
    #[error("cannot reach identity backend: {0}")]
    Connection(String),

    /// Malformed callback. Not retryable; forces a restart of the login.
    #[error("missing authentication parameters: {0}")]
    MissingParameters(String),

    /// The provider rejected the code/state exchange. Restart the login.
    #[error("token exchange rejected: {0}")]
    Exchange(String),

    /// Profile reconciliation failed. Non-fatal; login degrades instead.
    #[error("profile sync failed: {0}")]
    ProfileSync(String),

    /// Token refresh failed. Silent until the next authenticated call 401s.
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

impl AuthError {
    /// Whether user action (retry) can recover this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether the login flow must be restarted from the entry point.
    #[must_use]
    pub fn restarts_login(&self) -> bool {
        matches!(self, Self::MissingParameters(_) | Self::Exchange(_))
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Result of the authorize step.
#[derive(Clone, Debug)]
pub struct Authorization {
    /// Where to send the user's browser.
    pub auth_url: String,

    /// Correlation token to hold until the callback comes back.
    pub session_id: String,
}

/// Result of a successful token exchange.
pub struct TokenGrant {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub claims: UserInfo,
}

/// Strategy interface over the identity backend.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Requests an authorization URL and correlation session id.
    async fn authorize(&self) -> Result<Authorization>;

    /// Exchanges the callback triple for tokens and identity claims.
    async fn authenticate(
        &self,
        session_id: &str,
        csrf_token: &str,
        auth_code: &str,
    ) -> Result<TokenGrant>;

    /// Renews the access token. The refresh credential is the provider's
    /// own concern (an HTTP-only cookie on the live backend).
    async fn refresh(&self) -> Result<AccessToken>;

    /// Revokes the server-side session. Best effort.
    async fn logout(&self) -> Result<()>;
}

/// Live implementation against the AdVouch identity backend.
pub struct HttpIdentityProvider {
    http_client: http::Client,
    base_url: Url,
}

impl HttpIdentityProvider {
    const AUTHORIZE_PATH: &'static str = "/api/v1/authorize";
    const AUTHENTICATE_PATH: &'static str = "/api/v1/authenticate";
    const REFRESH_PATH: &'static str = "/api/v1/refresh";
    const LOGOUT_PATH: &'static str = "/api/v1/logout";

    /// Creates a provider from the configured identity endpoint.
    ///
    /// The cookie jar holds the HTTP-only refresh credential the backend
    /// sets during the token exchange.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> http::Result<Self> {
        let http_client = http::Client::with_cookies(config, reqwest::cookie::Jar::default())?;
        Ok(Self {
            http_client,
            base_url: config.identity_url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::Connection(format!("invalid identity endpoint: {e}")))
    }

    fn connection(&self, e: &reqwest::Error) -> AuthError {
        AuthError::Connection(format!(
            "identity backend at {} unreachable: {e}",
            self.base_url
        ))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn authorize(&self) -> Result<Authorization> {
        let url = self.endpoint(Self::AUTHORIZE_PATH)?;
        let request = self.http_client.get(url, "");

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| self.connection(&e))?;

        let status = response.status();
        if !status.is_success() {
            // The authorize step has no user input to reject; any failure
            // here reads as the backend being unreachable.
            return Err(AuthError::Connection(format!(
                "identity backend at {} answered {status}",
                self.base_url
            )));
        }

        let body = response.text().await.map_err(|e| self.connection(&e))?;
        let envelope: Envelope<AuthorizeData> =
            protocol::json(&body, "authorize").map_err(|e| AuthError::Connection(e.to_string()))?;

        Ok(Authorization {
            auth_url: envelope.data.auth_url,
            session_id: envelope.data.session_id,
        })
    }

    async fn authenticate(
        &self,
        session_id: &str,
        csrf_token: &str,
        auth_code: &str,
    ) -> Result<TokenGrant> {
        let url = self.endpoint(Self::AUTHENTICATE_PATH)?;
        let body = serde_json::to_string(&AuthenticateRequest {
            session_id: session_id.to_string(),
            csrf_token: csrf_token.to_string(),
            auth_code: auth_code.to_string(),
        })
        .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let mut request = self.http_client.post(url, body);
        request.headers_mut().insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| self.connection(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Exchange(format!(
                "identity backend rejected the exchange ({status})"
            )));
        }

        let body = response.text().await.map_err(|e| self.connection(&e))?;
        let envelope: Envelope<AuthenticateData> = protocol::json(&body, "authenticate")?;

        Ok(TokenGrant {
            access_token: AccessToken::with_default_lifetime(envelope.data.access_token),
            refresh_token: RefreshToken::new(envelope.data.refresh_token),
            claims: envelope.data.user_info,
        })
    }

    async fn refresh(&self) -> Result<AccessToken> {
        let url = self.endpoint(Self::REFRESH_PATH)?;
        let request = self.http_client.post(url, "");

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Refresh(format!(
                "identity backend answered {status}"
            )));
        }

        // Refresh responses are not enveloped.
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;
        let data: RefreshData =
            protocol::json(&body, "refresh").map_err(|e| AuthError::Refresh(e.to_string()))?;

        Ok(AccessToken::with_default_lifetime(data.access_token))
    }

    async fn logout(&self) -> Result<()> {
        let url = self.endpoint(Self::LOGOUT_PATH)?;
        let request = self.http_client.delete(url, "");

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| self.connection(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Connection(format!(
                "identity backend answered {status} on logout"
            )));
        }

        Ok(())
    }
}

/// Handshake material outstanding on the fake provider.
struct IssuedHandshake {
    session_id: String,
    csrf_token: String,
    auth_code: String,
}

/// Deterministic in-memory provider for demo mode and tests.
///
/// Mints one handshake at a time; authenticating consumes it. Token values
/// are sequenced so tests can observe replacement.
pub struct FakeIdentityProvider {
    issued: Mutex<Option<IssuedHandshake>>,
    user_type: Option<String>,
    display_name: String,
    fail_refresh: AtomicBool,
    fail_logout: AtomicBool,
    authenticate_calls: AtomicUsize,
    token_sequence: AtomicUsize,
}

impl FakeIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            issued: Mutex::new(None),
            user_type: None,
            display_name: "Demo User".to_string(),
            fail_refresh: AtomicBool::new(false),
            fail_logout: AtomicBool::new(false),
            authenticate_calls: AtomicUsize::new(0),
            token_sequence: AtomicUsize::new(0),
        }
    }

    /// Sets the backend account type reported for the demo user.
    #[must_use]
    pub fn with_user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }

    /// Makes subsequent refresh attempts fail.
    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent logout calls fail.
    pub fn set_fail_logout(&self, fail: bool) {
        self.fail_logout.store(fail, Ordering::SeqCst);
    }

    /// How many token exchanges were attempted.
    #[must_use]
    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    fn next_token(&self) -> String {
        let n = self.token_sequence.fetch_add(1, Ordering::SeqCst);
        format!("demo-access-{n}")
    }
}

impl Default for FakeIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn authorize(&self) -> Result<Authorization> {
        let handshake = IssuedHandshake {
            session_id: Uuid::fast_v4().to_string(),
            csrf_token: Uuid::fast_v4().to_string(),
            auth_code: Uuid::fast_v4().to_string(),
        };

        let authorization = Authorization {
            auth_url: format!(
                "advouch://callback?session_id={}&code={}&state={}",
                handshake.session_id, handshake.auth_code, handshake.csrf_token
            ),
            session_id: handshake.session_id.clone(),
        };

        // A new authorize overwrites any outstanding handshake.
        *self.issued.lock().expect("issued handshake poisoned") = Some(handshake);

        Ok(authorization)
    }

    async fn authenticate(
        &self,
        session_id: &str,
        csrf_token: &str,
        auth_code: &str,
    ) -> Result<TokenGrant> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);

        let mut issued = self.issued.lock().expect("issued handshake poisoned");
        let matches = issued.as_ref().is_some_and(|handshake| {
            handshake.session_id == session_id
                && handshake.csrf_token == csrf_token
                && handshake.auth_code == auth_code
        });

        if !matches {
            return Err(AuthError::Exchange(
                "unknown or already consumed handshake".to_string(),
            ));
        }
        // One-time code: consumed by this exchange.
        *issued = None;

        Ok(TokenGrant {
            access_token: AccessToken::with_default_lifetime(self.next_token()),
            refresh_token: RefreshToken::new("demo-refresh"),
            claims: UserInfo {
                sub: Some("demo-user-123".to_string()),
                name: Some(self.display_name.clone()),
                email: Some("demo@advouch.app".to_string()),
                phone_number: None,
                user_type: self.user_type.clone(),
            },
        })
    }

    async fn refresh(&self) -> Result<AccessToken> {
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(AuthError::Refresh("demo refresh failure".to_string()));
        }

        Ok(AccessToken::with_default_lifetime(self.next_token()))
    }

    async fn logout(&self) -> Result<()> {
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(AuthError::Connection("demo logout failure".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_handshake_is_single_use() {
        let provider = FakeIdentityProvider::new();
        let authorization = provider.authorize().await.unwrap();

        // Pull code and state out of the demo callback URL.
        let url = Url::parse(&authorization.auth_url).unwrap();
        let mut code = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        let code = code.unwrap();
        let state = state.unwrap();

        let grant = provider
            .authenticate(&authorization.session_id, &state, &code)
            .await
            .unwrap();
        assert_eq!(grant.claims.sub.as_deref(), Some("demo-user-123"));

        // Exchanging the same triple again must fail.
        let second = provider
            .authenticate(&authorization.session_id, &state, &code)
            .await;
        assert!(matches!(second, Err(AuthError::Exchange(_))));
    }

    #[tokio::test]
    async fn fake_refresh_can_be_failed() {
        let provider = FakeIdentityProvider::new();
        assert!(provider.refresh().await.is_ok());

        provider.set_fail_refresh(true);
        assert!(matches!(
            provider.refresh().await,
            Err(AuthError::Refresh(_))
        ));
    }

    #[test]
    fn error_classification() {
        assert!(AuthError::Connection("x".into()).is_retryable());
        assert!(!AuthError::Exchange("x".into()).is_retryable());
        assert!(AuthError::MissingParameters("x".into()).restarts_login());
        assert!(AuthError::Exchange("x".into()).restarts_login());
        assert!(!AuthError::Refresh("x".into()).restarts_login());
    }
}
