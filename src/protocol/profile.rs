//! Resource backend profile types.
//!
//! The application profile is reconciled against the raw identity claims
//! right after a token exchange. Sync failures degrade the login instead of
//! blocking it, so every field here is optional.

use serde::{Deserialize, Serialize};
use veil::Redact;

/// Application-side user profile.
#[derive(Clone, Default, Deserialize, Serialize, Redact)]
pub struct Profile {
    #[serde(default)]
    pub full_name: Option<String>,

    #[redact]
    #[serde(default)]
    pub email: Option<String>,

    #[redact]
    #[serde(default)]
    pub phone_number: Option<String>,

    /// Backend account type; source of truth for the initial mode.
    #[serde(default)]
    pub user_type: Option<String>,
}
