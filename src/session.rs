//! Client-side session and mode store.
//!
//! One explicit object owns the authenticated identity, its derived mode and
//! the per-mode profile-completion flags. All mutation goes through
//! [`SessionUpdate`] actions applied by a single reducer, so independent
//! flows (login, mode switch, refresh, logout) cannot clobber each other
//! with partial read-modify-write cycles. Same-process observers subscribe
//! through [`Session::subscribe`] instead of listening on global signals.

use std::{fmt, str::FromStr, sync::Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use veil::Redact;

use crate::{
    events::Event,
    store::{PersistedSession, Storage},
    tokens::{AccessToken, RefreshToken},
};

/// Route of the login entry point.
pub const LOGIN_ROUTE: &str = "/auth";

/// Client-side role selector governing which dashboard is shown.
///
/// Derived once from the backend account type at authentication time and
/// thereafter independently switchable by the client. Switching never
/// re-authenticates; it only changes presentation state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    User,
    Business,
    Advertiser,
}

impl Mode {
    /// Maps the backend account type to a mode.
    ///
    /// Anything unknown, including an absent type, is a plain user.
    #[must_use]
    pub fn from_user_type(user_type: Option<&str>) -> Self {
        match user_type {
            Some("business_owner") => Self::Business,
            Some("advertiser") => Self::Advertiser,
            _ => Self::User,
        }
    }

    /// The landing page for this mode after authentication.
    #[must_use]
    pub fn landing_route(&self) -> &'static str {
        match self {
            Self::Business => "/business/dashboard",
            Self::Advertiser => "/advertiser/dashboard",
            Self::User => "/ads",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Business => "business",
            Self::Advertiser => "advertiser",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "business" => Ok(Self::Business),
            "advertiser" => Ok(Self::Advertiser),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// The authenticated identity as exposed to callers.
///
/// Never carries credentials; tokens live next to it in the session state
/// and are handed out separately.
#[derive(Clone, Serialize, Deserialize, Redact)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub mode: Mode,
    #[redact]
    pub email: Option<String>,
    #[redact]
    pub phone: Option<String>,
    pub business_profile_complete: bool,
    pub advertiser_profile_complete: bool,
}

/// Full session state, mutated only through [`apply`].
#[derive(Default)]
struct SessionState {
    user: Option<User>,
    access_token: Option<AccessToken>,
    refresh_token: Option<RefreshToken>,

    /// Correlation token of an in-flight handshake. Single-use; at most one
    /// outstanding at a time.
    pending_session_id: Option<String>,

    /// Set when a background refresh failed. The session is then treated as
    /// logged-out-pending until the next 401 finalizes the logout.
    expired_pending: bool,
}

impl SessionState {
    /// True iff both a user record and a cached access token are present.
    fn is_authenticated(&self) -> bool {
        self.user.is_some() && self.access_token.is_some()
    }
}

/// Reducer actions over the session state.
#[derive(Clone)]
pub enum SessionUpdate {
    /// Starts a handshake, overwriting any prior pending session id.
    BeginHandshake { session_id: String },

    /// Drops any pending handshake state.
    ClearHandshake,

    /// Installs an authenticated session after a successful token exchange.
    LogIn {
        user: User,
        access_token: AccessToken,
        refresh_token: RefreshToken,
    },

    /// Changes the client-side mode. No-op without a session.
    SwitchMode(Mode),

    /// Updates exactly one per-mode completion flag, keyed by the mode
    /// argument. Idempotent; `Mode::User` has no flag and is a no-op.
    SetProfileComplete { mode: Mode, complete: bool },

    /// Replaces the cached access token in place.
    ReplaceAccessToken(AccessToken),

    /// Marks the session logged-out-pending after a refresh failure.
    MarkExpired,

    /// Clears all session material.
    LogOut,
}

/// Applies one update, returning the event to broadcast, if any.
fn apply(state: &mut SessionState, update: SessionUpdate) -> Option<Event> {
    match update {
        SessionUpdate::BeginHandshake { session_id } => {
            if state.pending_session_id.is_some() {
                debug!("overwriting pending handshake session id");
            }
            state.pending_session_id = Some(session_id);
            None
        }
        SessionUpdate::ClearHandshake => {
            state.pending_session_id = None;
            None
        }
        SessionUpdate::LogIn {
            user,
            access_token,
            refresh_token,
        } => {
            state.user = Some(user);
            state.access_token = Some(access_token);
            state.refresh_token = Some(refresh_token);
            state.expired_pending = false;
            Some(Event::LoggedIn)
        }
        SessionUpdate::SwitchMode(mode) => {
            let user = state.user.as_mut()?;
            user.mode = mode;
            Some(Event::ModeChanged(mode))
        }
        SessionUpdate::SetProfileComplete { mode, complete } => {
            let user = state.user.as_mut()?;
            match mode {
                Mode::Business => user.business_profile_complete = complete,
                Mode::Advertiser => user.advertiser_profile_complete = complete,
                Mode::User => {}
            }
            None
        }
        SessionUpdate::ReplaceAccessToken(token) => {
            if state.user.is_none() {
                return None;
            }
            state.access_token = Some(token);
            state.expired_pending = false;
            Some(Event::TokenRefreshed)
        }
        SessionUpdate::MarkExpired => {
            state.expired_pending = true;
            Some(Event::SessionExpired)
        }
        SessionUpdate::LogOut => {
            *state = SessionState::default();
            Some(Event::LoggedOut)
        }
    }
}

/// The session store.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. The mutex is
/// never held across an await point.
pub struct Session {
    state: Mutex<SessionState>,
    storage: Option<Storage>,
    events: broadcast::Sender<Event>,
}

impl Session {
    /// Same-process subscribers are few; a small buffer suffices.
    const EVENT_CAPACITY: usize = 16;

    /// Creates a store backed by a session file, restoring any persisted
    /// session from it.
    #[must_use]
    pub fn with_storage(storage: Storage) -> Self {
        let session = Self {
            state: Mutex::new(SessionState::default()),
            storage: Some(storage),
            events: broadcast::channel(Self::EVENT_CAPACITY).0,
        };
        session.restore();
        session
    }

    /// Creates a store with no persistence, for tests and demo mode.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            storage: None,
            events: broadcast::channel(Self::EVENT_CAPACITY).0,
        }
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Applies an update, persisting and broadcasting as needed.
    pub fn update(&self, update: SessionUpdate) {
        let persist = matches!(
            update,
            SessionUpdate::LogIn { .. }
                | SessionUpdate::SwitchMode(_)
                | SessionUpdate::SetProfileComplete { .. }
                | SessionUpdate::ReplaceAccessToken(_)
                | SessionUpdate::LogOut
        );

        let event = {
            let mut state = self.state.lock().expect("session state poisoned");
            let event = apply(&mut state, update);

            if persist {
                self.persist(&state);
            }

            event
        };

        if let Some(event) = event {
            // A send error only means there are no subscribers right now.
            let _ = self.events.send(event);
        }
    }

    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.state
            .lock()
            .expect("session state poisoned")
            .user
            .clone()
    }

    /// True iff both a user record and a cached access token are present;
    /// either alone is treated as logged out.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state
            .lock()
            .expect("session state poisoned")
            .is_authenticated()
    }

    #[must_use]
    pub fn user_mode(&self) -> Option<Mode> {
        self.state
            .lock()
            .expect("session state poisoned")
            .user
            .as_ref()
            .map(|user| user.mode)
    }

    /// The cached access token.
    ///
    /// Falls back to the persisted session file when the in-memory cache is
    /// empty, restoring the whole session in the process.
    #[must_use]
    pub fn access_token(&self) -> Option<AccessToken> {
        {
            let state = self.state.lock().expect("session state poisoned");
            if let Some(ref token) = state.access_token {
                return Some(token.clone());
            }
        }

        self.restore();
        self.state
            .lock()
            .expect("session state poisoned")
            .access_token
            .clone()
    }

    /// True once a refresh failure has marked the session logged-out-pending.
    #[must_use]
    pub fn is_expired_pending(&self) -> bool {
        self.state
            .lock()
            .expect("session state poisoned")
            .expired_pending
    }

    /// Switches the client-side mode without re-authenticating.
    ///
    /// The backend account type is not re-validated here; this is the single
    /// seam where such a check would be inserted.
    pub fn switch_mode(&self, mode: Mode) {
        self.update(SessionUpdate::SwitchMode(mode));
    }

    pub fn set_profile_complete(&self, mode: Mode, complete: bool) {
        self.update(SessionUpdate::SetProfileComplete { mode, complete });
    }

    /// Records the session id of a freshly started handshake.
    pub fn begin_handshake(&self, session_id: impl Into<String>) {
        self.update(SessionUpdate::BeginHandshake {
            session_id: session_id.into(),
        });
    }

    /// Consumes the pending session id iff it matches the callback's.
    ///
    /// Returns `false` without consuming when there is no pending handshake
    /// or the ids differ. On `true` the id is gone: a second callback with
    /// the same triple will not match again.
    #[must_use]
    pub fn match_and_consume_handshake(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().expect("session state poisoned");
        if state.pending_session_id.as_deref() == Some(session_id) {
            state.pending_session_id = None;
            true
        } else {
            false
        }
    }

    fn persist(&self, state: &SessionState) {
        let Some(ref storage) = self.storage else {
            return;
        };

        let snapshot = match (&state.user, &state.access_token, &state.refresh_token) {
            (Some(user), Some(access_token), Some(refresh_token)) => Some(PersistedSession {
                user: user.clone(),
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
            }),
            _ => None,
        };

        // Persistence is best effort: a read-only state directory should not
        // take down an otherwise working session.
        let result = match snapshot {
            Some(ref session) => storage.save(session),
            None => storage.clear(),
        };
        if let Err(e) = result {
            warn!("could not persist session: {e}");
        }
    }

    fn restore(&self) {
        let Some(ref storage) = self.storage else {
            return;
        };

        match storage.load() {
            Ok(Some(persisted)) => {
                let mut state = self.state.lock().expect("session state poisoned");
                if state.user.is_none() {
                    state.user = Some(persisted.user);
                    state.access_token = Some(persisted.access_token);
                    state.refresh_token = Some(persisted.refresh_token);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("could not restore session: {e}"),
        }
    }
}
