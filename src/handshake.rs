//! The authorize → redirect → callback → token-exchange sequence.
//!
//! [`Handshake::authorize`] starts the flow and records the correlation
//! session id; [`Handshake::complete_authentication`] finishes it when the
//! identity provider redirects back with a code and state. The session id is
//! single-use: it is consumed before the exchange is attempted, so a replayed
//! callback can never trigger a second exchange.
//!
//! Handshake-stage failures abort the whole flow and send the caller back to
//! the login entry point; only profile reconciliation degrades gracefully.

use std::sync::Arc;

use crate::{
    identity::{AuthError, IdentityProvider},
    profile::ProfileApi,
    protocol::profile::Profile,
    session::{Mode, Session, SessionUpdate, User},
};

pub struct Handshake {
    provider: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileApi>,
    session: Arc<Session>,
}

impl Handshake {
    #[must_use]
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileApi>,
        session: Arc<Session>,
    ) -> Self {
        Self {
            provider,
            profiles,
            session,
        }
    }

    /// Starts a login: obtains the authorization URL and stores the session
    /// id for the later callback.
    ///
    /// Exactly one session id write per successful call; a prior in-flight
    /// handshake is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Connection`] when the identity backend cannot be
    /// reached. The caller must surface a retry affordance and must not
    /// redirect.
    pub async fn authorize(&self) -> Result<String, AuthError> {
        let authorization = self.provider.authorize().await?;

        debug!("handshake started, session id recorded");
        self.session.begin_handshake(authorization.session_id);

        Ok(authorization.auth_url)
    }

    /// Completes a login from the provider's callback parameters.
    ///
    /// Returns the landing route for the authenticated mode.
    ///
    /// # Errors
    ///
    /// * [`AuthError::MissingParameters`] - a parameter is empty or the
    ///   session id does not match the stored one (including an already
    ///   consumed handshake). No exchange is performed and no session state
    ///   is mutated.
    /// * [`AuthError::Exchange`] / [`AuthError::Connection`] - the exchange
    ///   itself failed. Partial state is discarded; the stored session id
    ///   has already been consumed.
    pub async fn complete_authentication(
        &self,
        session_id: &str,
        state: &str,
        code: &str,
    ) -> Result<&'static str, AuthError> {
        if session_id.is_empty() || state.is_empty() || code.is_empty() {
            return Err(AuthError::MissingParameters(
                "callback is missing session id, state or code".to_string(),
            ));
        }

        // Consume the stored id up front: whatever the exchange outcome, the
        // handshake is spent.
        if !self.session.match_and_consume_handshake(session_id) {
            return Err(AuthError::MissingParameters(
                "no matching handshake in progress".to_string(),
            ));
        }

        let grant = self.provider.authenticate(session_id, state, code).await?;

        // Reconcile the application profile; never block the login on it.
        let profile = match self.profiles.sync_profile(&grant.access_token, &grant.claims).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("could not sync profile: {e}");
                match self.profiles.get_me(&grant.access_token).await {
                    Ok(profile) => Some(profile),
                    Err(e) => {
                        warn!("could not fetch existing profile: {e}");
                        None
                    }
                }
            }
        };

        let profile = profile.unwrap_or_else(|| {
            info!("proceeding with degraded profile");
            Profile::default()
        });

        let user_type = profile.user_type.as_deref().or(grant.claims.user_type.as_deref());
        let mode = Mode::from_user_type(user_type);

        let user = User {
            id: grant
                .claims
                .sub
                .clone()
                .unwrap_or_else(|| "user".to_string()),
            display_name: profile
                .full_name
                .or_else(|| grant.claims.name.clone())
                .unwrap_or_else(|| "User".to_string()),
            mode,
            email: profile.email.or_else(|| grant.claims.email.clone()),
            phone: profile
                .phone_number
                .or_else(|| grant.claims.phone_number.clone()),
            business_profile_complete: false,
            advertiser_profile_complete: false,
        };

        info!("authenticated as {} ({mode})", user.display_name);
        self.session.update(SessionUpdate::LogIn {
            user,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
        });

        Ok(mode.landing_route())
    }

    /// Ends the session: best-effort server-side revocation, then a full
    /// local clear. Network failure never blocks the local logout.
    pub async fn logout(&self) {
        if let Err(e) = self.provider.logout().await {
            warn!("server-side logout failed: {e}");
        }

        self.session.update(SessionUpdate::LogOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::Event,
        identity::FakeIdentityProvider,
        profile::FakeProfileApi,
    };
    use url::Url;

    struct Fixture {
        provider: Arc<FakeIdentityProvider>,
        session: Arc<Session>,
        handshake: Handshake,
    }

    fn fixture(provider: FakeIdentityProvider, profiles: FakeProfileApi) -> Fixture {
        let provider = Arc::new(provider);
        let session = Arc::new(Session::in_memory());
        let handshake = Handshake::new(
            Arc::clone(&provider) as Arc<dyn IdentityProvider>,
            Arc::new(profiles) as Arc<dyn ProfileApi>,
            Arc::clone(&session),
        );
        Fixture {
            provider,
            session,
            handshake,
        }
    }

    /// Runs authorize and extracts the callback triple from the demo URL.
    async fn start(fx: &Fixture) -> (String, String, String) {
        let auth_url = fx.handshake.authorize().await.unwrap();
        let url = Url::parse(&auth_url).unwrap();

        let mut session_id = String::new();
        let mut code = String::new();
        let mut state = String::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "session_id" => session_id = value.into_owned(),
                "code" => code = value.into_owned(),
                "state" => state = value.into_owned(),
                _ => {}
            }
        }

        (session_id, state, code)
    }

    #[tokio::test]
    async fn full_handshake_lands_on_mode_dashboard() {
        let fx = fixture(
            FakeIdentityProvider::new().with_user_type("business_owner"),
            FakeProfileApi::default(),
        );
        let (session_id, state, code) = start(&fx).await;

        let route = fx
            .handshake
            .complete_authentication(&session_id, &state, &code)
            .await
            .unwrap();

        assert_eq!(route, "/business/dashboard");
        assert!(fx.session.is_authenticated());

        let user = fx.session.current_user().unwrap();
        assert_eq!(user.mode, Mode::Business);
        assert_eq!(user.display_name, "Synced Name");
        assert_eq!(fx.session.user_mode(), Some(Mode::Business));
    }

    #[tokio::test]
    async fn second_callback_with_same_triple_fails() {
        let fx = fixture(FakeIdentityProvider::new(), FakeProfileApi::default());
        let (session_id, state, code) = start(&fx).await;

        fx.handshake
            .complete_authentication(&session_id, &state, &code)
            .await
            .unwrap();

        let replay = fx
            .handshake
            .complete_authentication(&session_id, &state, &code)
            .await;
        assert!(matches!(replay, Err(AuthError::MissingParameters(_))));
        // Only the first callback reached the provider.
        assert_eq!(fx.provider.authenticate_calls(), 1);
    }

    #[tokio::test]
    async fn empty_parameters_never_reach_the_exchange() {
        let fx = fixture(FakeIdentityProvider::new(), FakeProfileApi::default());
        let (session_id, state, code) = start(&fx).await;

        for (sid, st, c) in [
            ("", state.as_str(), code.as_str()),
            (session_id.as_str(), "", code.as_str()),
            (session_id.as_str(), state.as_str(), ""),
        ] {
            let result = fx.handshake.complete_authentication(sid, st, c).await;
            assert!(matches!(result, Err(AuthError::MissingParameters(_))));
        }

        assert_eq!(fx.provider.authenticate_calls(), 0);
        assert!(!fx.session.is_authenticated());

        // The handshake was not consumed by the malformed callbacks.
        let route = fx
            .handshake
            .complete_authentication(&session_id, &state, &code)
            .await
            .unwrap();
        assert_eq!(route, "/ads");
    }

    #[tokio::test]
    async fn mismatched_session_id_is_rejected_without_exchange() {
        let fx = fixture(FakeIdentityProvider::new(), FakeProfileApi::default());
        let (_session_id, state, code) = start(&fx).await;

        let result = fx
            .handshake
            .complete_authentication("someone-elses-id", &state, &code)
            .await;

        assert!(matches!(result, Err(AuthError::MissingParameters(_))));
        assert_eq!(fx.provider.authenticate_calls(), 0);
        assert!(!fx.session.is_authenticated());
    }

    #[tokio::test]
    async fn rejected_exchange_consumes_the_handshake() {
        let fx = fixture(FakeIdentityProvider::new(), FakeProfileApi::default());
        let (session_id, state, _code) = start(&fx).await;

        let result = fx
            .handshake
            .complete_authentication(&session_id, &state, "forged-code")
            .await;
        assert!(matches!(result, Err(AuthError::Exchange(_))));
        assert!(!fx.session.is_authenticated());

        // Even the genuine code cannot be replayed now.
        let retry = fx
            .handshake
            .complete_authentication(&session_id, &state, "forged-code")
            .await;
        assert!(matches!(retry, Err(AuthError::MissingParameters(_))));
    }

    #[tokio::test]
    async fn profile_sync_failure_falls_back_to_existing_profile() {
        let profiles = FakeProfileApi::new();
        profiles.set_fail_sync(true);
        let fx = fixture(FakeIdentityProvider::new(), profiles);
        let (session_id, state, code) = start(&fx).await;

        fx.handshake
            .complete_authentication(&session_id, &state, &code)
            .await
            .unwrap();

        let user = fx.session.current_user().unwrap();
        assert_eq!(user.display_name, "Existing Name");
    }

    #[tokio::test]
    async fn degraded_profile_still_logs_in() {
        let profiles = FakeProfileApi::new();
        profiles.set_fail_sync(true);
        profiles.set_fail_get_me(true);
        let fx = fixture(FakeIdentityProvider::new(), profiles);
        let (session_id, state, code) = start(&fx).await;

        let route = fx
            .handshake
            .complete_authentication(&session_id, &state, &code)
            .await
            .unwrap();

        assert_eq!(route, "/ads");
        assert!(fx.session.is_authenticated());
        // Name falls back to the identity claims.
        let user = fx.session.current_user().unwrap();
        assert_eq!(user.display_name, "Demo User");
    }

    #[tokio::test]
    async fn mode_prefers_profile_account_type_over_claims() {
        let profiles = FakeProfileApi::new().with_user_type("advertiser");
        let fx = fixture(FakeIdentityProvider::new(), profiles);
        let (session_id, state, code) = start(&fx).await;

        let route = fx
            .handshake
            .complete_authentication(&session_id, &state, &code)
            .await
            .unwrap();

        assert_eq!(route, "/advertiser/dashboard");
        assert_eq!(fx.session.user_mode(), Some(Mode::Advertiser));
    }

    #[tokio::test]
    async fn logout_clears_locally_even_when_revocation_fails() {
        let fx = fixture(FakeIdentityProvider::new(), FakeProfileApi::default());
        let (session_id, state, code) = start(&fx).await;
        fx.handshake
            .complete_authentication(&session_id, &state, &code)
            .await
            .unwrap();

        fx.provider.set_fail_logout(true);
        let mut events = fx.session.subscribe();

        fx.handshake.logout().await;

        assert!(!fx.session.is_authenticated());
        assert_eq!(events.try_recv().unwrap(), Event::LoggedOut);
    }
}
