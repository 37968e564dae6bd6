//! Wire types for the AdVouch backends.
//!
//! The wire shapes belong to the external services and are treated as fixed
//! contracts:
//!
//! * [`identity`] - authorize / authenticate / refresh endpoints of the
//!   identity backend
//! * [`profile`] - the resource backend's profile API
//!
//! Both backends wrap their payloads in a common `{ "data": ..., "message": ... }`
//! envelope, modeled by [`Envelope`].

use serde::Deserialize;

use crate::identity::AuthError;

pub mod identity;
pub mod profile;

/// Response envelope used by both AdVouch backends.
#[derive(Clone, Debug, Deserialize)]
pub struct Envelope<T> {
    /// The actual payload.
    pub data: T,

    /// Human-readable status message; informational only.
    #[serde(default)]
    pub message: Option<String>,
}

/// Parses a JSON response body, logging the outcome.
///
/// Successful parses are logged at TRACE level with the endpoint name only,
/// never the body, since most payloads carry credentials.
pub fn json<T>(body: &str, endpoint: &str) -> Result<T, AuthError>
where
    T: for<'de> Deserialize<'de>,
{
    match serde_json::from_str::<T>(body) {
        Ok(parsed) => {
            trace!("{endpoint}: response parsed");
            Ok(parsed)
        }
        Err(e) => {
            error!("{endpoint}: malformed response: {e}");
            Err(AuthError::Exchange(format!(
                "{endpoint} returned a malformed response: {e}"
            )))
        }
    }
}
