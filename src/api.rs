//! Authenticated request wrapper for the resource backend.
//!
//! Attaches the cached access token as a bearer credential and owns the
//! single point where expired credentials are detected: a 401 response
//! triggers exactly one refresh-and-retry; if that also fails, session state
//! is cleared and the caller is sent back to the login entry point.

use std::sync::Arc;

use reqwest::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method, StatusCode, Url,
};

use crate::{
    config::Config,
    http,
    identity::{AuthError, IdentityProvider},
    session::{Session, SessionUpdate, LOGIN_ROUTE},
    tokens::AccessToken,
};

pub struct ApiClient {
    http_client: http::Client,
    provider: Arc<dyn IdentityProvider>,
    session: Arc<Session>,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        config: &Config,
        provider: Arc<dyn IdentityProvider>,
        session: Arc<Session>,
    ) -> http::Result<Self> {
        let http_client = http::Client::without_cookies(config)?;
        Ok(Self {
            http_client,
            provider,
            session,
        })
    }

    /// Sends an authenticated request, recovering once from a 401.
    ///
    /// # Errors
    ///
    /// * [`AuthError::Connection`] - transport failure
    /// * [`AuthError::Refresh`] - credentials could not be recovered; the
    ///   session has been cleared and the login flow must restart
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<reqwest::Response, AuthError> {
        let token = self.session.access_token();
        let response = self
            .send(method.clone(), url.clone(), body.clone(), token.as_ref())
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("401 from {url}, attempting refresh-and-retry");
        let token = self.recover_unauthorized().await?;
        let retry = self.send(method, url, body, Some(&token)).await?;

        if retry.status() == StatusCode::UNAUTHORIZED {
            self.force_logout();
            return Err(AuthError::Refresh(
                "request rejected again after refresh".to_string(),
            ));
        }

        Ok(retry)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
        token: Option<&AccessToken>,
    ) -> Result<reqwest::Response, AuthError> {
        let mut request = self
            .http_client
            .request(method, url, body.unwrap_or_default());

        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AuthError::Connection(e.to_string()))?;
            headers.insert(AUTHORIZATION, bearer);
        }

        self.http_client
            .execute(request)
            .await
            .map_err(|e| AuthError::Connection(e.to_string()))
    }

    /// Attempts the one permitted refresh after a 401.
    ///
    /// On success the session's cached token is replaced and returned; on
    /// failure the session is cleared and the login flow must restart.
    ///
    /// # Errors
    ///
    /// Returns the provider's refresh error after forcing the logout.
    pub async fn recover_unauthorized(&self) -> Result<AccessToken, AuthError> {
        match self.provider.refresh().await {
            Ok(token) => {
                self.session
                    .update(SessionUpdate::ReplaceAccessToken(token.clone()));
                Ok(token)
            }
            Err(e) => {
                self.force_logout();
                Err(e)
            }
        }
    }

    fn force_logout(&self) {
        warn!("credentials rejected, forcing logout");
        self.session.update(SessionUpdate::LogOut);
        info!("returning to {LOGIN_ROUTE}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::Event,
        identity::FakeIdentityProvider,
        refresh::RefreshLoop,
        session::{Mode, User},
        tokens::RefreshToken,
    };

    fn authenticated_session() -> Arc<Session> {
        let session = Arc::new(Session::in_memory());
        session.update(SessionUpdate::LogIn {
            user: User {
                id: "user-1".to_string(),
                display_name: "Abebe".to_string(),
                mode: Mode::User,
                email: None,
                phone: None,
                business_profile_complete: false,
                advertiser_profile_complete: false,
            },
            access_token: AccessToken::with_default_lifetime("initial"),
            refresh_token: RefreshToken::new("refresh"),
        });
        session
    }

    fn client(provider: Arc<FakeIdentityProvider>, session: Arc<Session>) -> ApiClient {
        ApiClient::new(&Config::new(), provider, session).unwrap()
    }

    #[tokio::test]
    async fn recovery_replaces_the_cached_token() {
        let provider = Arc::new(FakeIdentityProvider::new());
        let session = authenticated_session();
        let api = client(Arc::clone(&provider), Arc::clone(&session));

        let token = api.recover_unauthorized().await.unwrap();
        assert_ne!(token.as_str(), "initial");
        assert_eq!(
            session.access_token().unwrap().as_str(),
            token.as_str()
        );
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn failed_recovery_forces_logout() {
        let provider = Arc::new(FakeIdentityProvider::new());
        provider.set_fail_refresh(true);
        let session = authenticated_session();
        let api = client(Arc::clone(&provider), Arc::clone(&session));
        let mut events = session.subscribe();

        let result = api.recover_unauthorized().await;

        assert!(matches!(result, Err(AuthError::Refresh(_))));
        assert!(!session.is_authenticated());
        assert!(session.current_user().is_none());
        assert_eq!(events.try_recv().unwrap(), Event::LoggedOut);
        assert_eq!(LOGIN_ROUTE, "/auth");
    }

    /// A failed background refresh defers the logout; the next 401's
    /// recovery attempt then finalizes it.
    #[tokio::test]
    async fn deferred_refresh_failure_escalates_on_next_401() {
        let provider = Arc::new(FakeIdentityProvider::new());
        provider.set_fail_refresh(true);
        let session = authenticated_session();

        let refresh = RefreshLoop::new(Arc::clone(&provider) as _, Arc::clone(&session));
        assert!(refresh.refresh_once().await.is_err());
        assert!(session.is_authenticated());

        let api = client(Arc::clone(&provider), Arc::clone(&session));
        let result = api.recover_unauthorized().await;

        assert!(result.is_err());
        assert!(!session.is_authenticated());
    }
}
