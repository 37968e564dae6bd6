//! Background access-token renewal.
//!
//! A recurring timer renews the access token well before its known lifetime
//! runs out (50 minutes for a 60 minute token). The first firing is
//! scheduled from the cached token's age, so a session restored with an
//! already stale token is renewed right away. Each firing performs at most
//! one refresh attempt; a single-flight guard skips a firing outright if a
//! previous attempt is still on the wire, so slow networks cannot stack
//! concurrent refreshes.
//!
//! A failed refresh never surfaces to the user directly: the session is
//! marked logged-out-pending and the next authenticated request's 401
//! handling finalizes the logout.

use std::{sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    identity::{AuthError, IdentityProvider},
    session::{Session, SessionUpdate},
    tokens::AccessToken,
};

pub struct RefreshLoop {
    provider: Arc<dyn IdentityProvider>,
    session: Arc<Session>,
    period: Duration,

    /// Single-flight guard: a firing that finds a refresh in flight skips
    /// its attempt instead of queueing behind it.
    in_flight: tokio::sync::Mutex<()>,
}

impl RefreshLoop {
    /// Margin under the 60 minute token lifetime.
    pub const PERIOD: Duration = Duration::from_secs(50 * 60);

    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, session: Arc<Session>) -> Self {
        Self::with_period(provider, session, Self::PERIOD)
    }

    #[must_use]
    pub fn with_period(
        provider: Arc<dyn IdentityProvider>,
        session: Arc<Session>,
        period: Duration,
    ) -> Self {
        Self {
            provider,
            session,
            period,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Refresh failures are logged and absorbed; nothing escapes the loop.
    /// Cancellation does not abort an in-flight request, only stops
    /// scheduling new ones.
    pub async fn run(&self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.first_tick();
        let mut interval = tokio::time::interval_at(start, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    debug!("refresh loop stopped");
                    break;
                }

                _ = interval.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!("token refresh failed: {e}");
                    }
                }
            }
        }
    }

    /// Delay until the first renewal, measured from the cached token's age.
    ///
    /// A token fresh from login waits the full period; a stale token from a
    /// restored session is renewed immediately instead of being left to
    /// expire during the first interval.
    fn first_tick(&self) -> Duration {
        let Some(token) = self.session.access_token() else {
            return self.period;
        };

        let age = AccessToken::LIFETIME.saturating_sub(token.time_to_live());
        self.period.saturating_sub(age)
    }

    /// Performs at most one refresh attempt.
    ///
    /// No-ops when not authenticated or when another attempt is in flight.
    /// On success the cached access token is replaced in place; on failure
    /// the session is marked logged-out-pending.
    ///
    /// # Errors
    ///
    /// Returns the provider's [`AuthError::Refresh`] after marking the
    /// session expired.
    pub async fn refresh_once(&self) -> Result<(), AuthError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("refresh already in flight, skipping");
            return Ok(());
        };

        if !self.session.is_authenticated() {
            return Ok(());
        }

        match self.provider.refresh().await {
            Ok(token) => {
                debug!("access token renewed");
                self.session.update(SessionUpdate::ReplaceAccessToken(token));
                Ok(())
            }
            Err(e) => {
                self.session.update(SessionUpdate::MarkExpired);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::Event,
        identity::FakeIdentityProvider,
        session::{Mode, User},
        tokens::{AccessToken, RefreshToken},
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

    #[tokio::test]
    async fn successful_refresh_replaces_token_in_place() {
        let provider = Arc::new(FakeIdentityProvider::new());
        let session = authenticated_session();
        let refresh = RefreshLoop::new(provider, Arc::clone(&session));

        let mut events = session.subscribe();
        refresh.refresh_once().await.unwrap();

        let token = session.access_token().unwrap();
        assert_ne!(token.as_str(), "initial");
        assert_eq!(events.try_recv().unwrap(), Event::TokenRefreshed);
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn failed_refresh_defers_logout() {
        let provider = Arc::new(FakeIdentityProvider::new());
        provider.set_fail_refresh(true);
        let session = authenticated_session();
        let refresh = RefreshLoop::new(provider, Arc::clone(&session));

        let mut events = session.subscribe();
        let result = refresh.refresh_once().await;

        assert!(matches!(result, Err(AuthError::Refresh(_))));
        assert_eq!(events.try_recv().unwrap(), Event::SessionExpired);
        // Not cleared yet: the next 401 finalizes the logout.
        assert!(session.is_authenticated());
        assert!(session.is_expired_pending());
    }

    #[tokio::test]
    async fn refresh_skips_when_logged_out() {
        let provider = Arc::new(FakeIdentityProvider::new());
        let session = Arc::new(Session::in_memory());
        let refresh = RefreshLoop::new(provider, Arc::clone(&session));

        refresh.refresh_once().await.unwrap();
        assert!(session.access_token().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_fires_and_tears_down_on_cancel() {
        let provider = Arc::new(FakeIdentityProvider::new());
        let session = authenticated_session();
        let refresh = Arc::new(RefreshLoop::with_period(
            provider.clone(),
            Arc::clone(&session),
            Duration::from_millis(10),
        ));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let refresh = Arc::clone(&refresh);
            let shutdown = shutdown.clone();
            async move { refresh.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;

        let token = session.access_token().unwrap();
        assert_ne!(token.as_str(), "initial");

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_persistent_failures() {
        let provider = Arc::new(FakeIdentityProvider::new());
        provider.set_fail_refresh(true);
        let session = authenticated_session();
        let refresh = Arc::new(RefreshLoop::with_period(
            provider,
            Arc::clone(&session),
            Duration::from_millis(10),
        ));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let refresh = Arc::clone(&refresh);
            let shutdown = shutdown.clone();
            async move { refresh.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        // No panic escaped; the loop is still running and cancellable.
        assert!(!task.is_finished());
        assert!(session.is_expired_pending());

        shutdown.cancel();
        task.await.unwrap();
    }

    /// A restored session may come back with a token older than the refresh
    /// period; the loop must not wait a full interval to renew it.
    #[tokio::test(start_paused = true)]
    async fn stale_restored_token_is_renewed_immediately() {
        let provider = Arc::new(FakeIdentityProvider::new());
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
            // Five minutes of lifetime left, well past the renewal point.
            access_token: AccessToken::new(
                "stale",
                std::time::SystemTime::now() + Duration::from_secs(5 * 60),
            ),
            refresh_token: RefreshToken::new("refresh"),
        });

        let refresh = Arc::new(RefreshLoop::new(
            Arc::clone(&provider) as _,
            Arc::clone(&session),
        ));
        assert_eq!(refresh.first_tick(), Duration::ZERO);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let refresh = Arc::clone(&refresh);
            let shutdown = shutdown.clone();
            async move { refresh.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert_ne!(session.access_token().unwrap().as_str(), "stale");

        shutdown.cancel();
        task.await.unwrap();
    }
}
