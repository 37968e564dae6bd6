use std::{
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use veil::Redact;

/// Short-lived bearer credential for the AdVouch APIs.
///
/// The identity backend issues access tokens with a 60 minute lifetime but
/// does not echo the expiry back on refresh, so the lifetime is tracked
/// client-side from the moment the token was received.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Redact)]
pub struct AccessToken {
    #[redact]
    token: String,
    expires_at: SystemTime,
}

impl AccessToken {
    /// Known lifetime of an access token as issued by the identity backend.
    pub const LIFETIME: Duration = Duration::from_secs(60 * 60);

    #[must_use]
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Creates a token stamped with the backend's known lifetime.
    #[must_use]
    pub fn with_default_lifetime(token: impl Into<String>) -> Self {
        Self::new(token, SystemTime::now() + Self::LIFETIME)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Longer-lived credential consumed only by the refresh loop.
///
/// Opaque to everything else; never handed to UI-facing callers.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Redact)]
#[redact(all)]
pub struct RefreshToken(String);

impl RefreshToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
