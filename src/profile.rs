//! Application profile reconciliation against the resource backend.
//!
//! Called once per login to create-or-update the local profile record from
//! the raw identity claims. Every failure here is a [`AuthError::ProfileSync`]
//! and the caller degrades instead of blocking the login.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use url::Url;

use crate::{
    config::Config,
    http,
    identity::AuthError,
    protocol::{self, identity::UserInfo, profile::Profile, Envelope},
    tokens::AccessToken,
};

/// Strategy interface over the resource backend's profile API.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    /// Create-or-update the profile from raw identity claims.
    async fn sync_profile(
        &self,
        token: &AccessToken,
        claims: &UserInfo,
    ) -> Result<Profile, AuthError>;

    /// Fetches the pre-existing profile, if the account has one.
    async fn get_me(&self, token: &AccessToken) -> Result<Profile, AuthError>;
}

/// Live implementation against the AdVouch resource backend.
pub struct HttpProfileApi {
    http_client: http::Client,
    base_url: Url,
}

impl HttpProfileApi {
    const SYNC_PATH: &'static str = "/api/v1/me/sync";
    const ME_PATH: &'static str = "/api/v1/me/";

    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> http::Result<Self> {
        let http_client = http::Client::without_cookies(config)?;
        Ok(Self {
            http_client,
            base_url: config.resource_url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::ProfileSync(format!("invalid profile endpoint: {e}")))
    }

    async fn execute(
        &self,
        mut request: reqwest::Request,
        token: &AccessToken,
        endpoint: &str,
    ) -> Result<Profile, AuthError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| AuthError::ProfileSync(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| AuthError::ProfileSync(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::ProfileSync(format!(
                "resource backend answered {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::ProfileSync(e.to_string()))?;
        let envelope: Envelope<Profile> =
            protocol::json(&body, endpoint).map_err(|e| AuthError::ProfileSync(e.to_string()))?;

        Ok(envelope.data)
    }
}

#[async_trait]
impl ProfileApi for HttpProfileApi {
    async fn sync_profile(
        &self,
        token: &AccessToken,
        claims: &UserInfo,
    ) -> Result<Profile, AuthError> {
        let url = self.endpoint(Self::SYNC_PATH)?;
        let body =
            serde_json::to_string(claims).map_err(|e| AuthError::ProfileSync(e.to_string()))?;

        let mut request = self.http_client.post(url, body);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        self.execute(request, token, "sync_profile").await
    }

    async fn get_me(&self, token: &AccessToken) -> Result<Profile, AuthError> {
        let url = self.endpoint(Self::ME_PATH)?;
        let request = self.http_client.get(url, "");

        self.execute(request, token, "get_me").await
    }
}

/// Deterministic in-memory profile API for demo mode and tests.
///
/// Sync echoes the identity claims back as a profile; both calls have
/// switchable failure modes so the degradation chain can be exercised.
#[derive(Default)]
pub struct FakeProfileApi {
    fail_sync: AtomicBool,
    fail_get_me: AtomicBool,
    user_type: Option<String>,
}

impl FakeProfileApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the account type stored on the fake profile record, overriding
    /// whatever the identity claims say.
    #[must_use]
    pub fn with_user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }

    /// Makes subsequent sync calls fail.
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `get_me` calls fail.
    pub fn set_fail_get_me(&self, fail: bool) {
        self.fail_get_me.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProfileApi for FakeProfileApi {
    async fn sync_profile(
        &self,
        _token: &AccessToken,
        claims: &UserInfo,
    ) -> Result<Profile, AuthError> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(AuthError::ProfileSync("sync unavailable".to_string()));
        }

        Ok(Profile {
            full_name: Some("Synced Name".to_string()),
            email: claims.email.clone(),
            phone_number: None,
            user_type: self.user_type.clone().or_else(|| claims.user_type.clone()),
        })
    }

    async fn get_me(&self, _token: &AccessToken) -> Result<Profile, AuthError> {
        if self.fail_get_me.load(Ordering::SeqCst) {
            return Err(AuthError::ProfileSync("me unavailable".to_string()));
        }

        Ok(Profile {
            full_name: Some("Existing Name".to_string()),
            ..Profile::default()
        })
    }
}
