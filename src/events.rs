//! Events emitted by the session store.
//!
//! Components that care about authentication state subscribe to the session
//! store and receive these instead of listening on ambient global signals.
//! Cross-process observers are out of scope; the broadcast only covers
//! same-process subscribers.

use crate::session::Mode;

/// Significant changes to the authenticated session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// A handshake completed and a session was persisted.
    LoggedIn,

    /// The session was cleared, either by an explicit logout or after an
    /// unrecoverable credential failure.
    LoggedOut,

    /// The client-side mode selector changed.
    ///
    /// Carries the mode that is now active. Emitted by `switch_mode` only;
    /// the initial mode set at login is covered by [`LoggedIn`](Self::LoggedIn).
    ModeChanged(Mode),

    /// The background refresh replaced the cached access token.
    TokenRefreshed,

    /// A refresh attempt failed and the session is logged-out-pending.
    ///
    /// State is not cleared yet; the next authenticated request's 401
    /// handling finalizes the logout.
    SessionExpired,
}
