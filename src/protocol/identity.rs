//! Identity backend request and response types.
//!
//! The identity backend brokers the Fayda OAuth flow on the client's behalf:
//!
//! ```json
//! GET /api/v1/authorize
//! { "data": { "auth_url": "https://idp/...", "session_id": "..." } }
//!
//! POST /api/v1/authenticate
//! { "session_id": "...", "csrf_token": "...", "auth_code": "..." }
//! { "data": { "access_token": "...", "refresh_token": "...", "user_info": { ... } } }
//!
//! POST /api/v1/refresh
//! { "access_token": "..." }
//! ```
//!
//! The refresh credential itself travels as an HTTP-only cookie, not in the
//! JSON body.

use serde::{Deserialize, Serialize};
use veil::Redact;

/// Payload of the authorize endpoint.
///
/// `auth_url` is kept as a string: the demo provider returns relative URLs.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthorizeData {
    /// Where to send the user's browser to authenticate.
    pub auth_url: String,

    /// Correlation token binding this authorize call to its later callback.
    pub session_id: String,
}

/// Body of the authenticate (token exchange) request.
#[derive(Clone, Serialize, Redact)]
pub struct AuthenticateRequest {
    pub session_id: String,
    #[redact]
    pub csrf_token: String,
    #[redact]
    pub auth_code: String,
}

/// Payload of a successful token exchange.
#[derive(Clone, Deserialize, Redact)]
pub struct AuthenticateData {
    #[redact]
    pub access_token: String,

    #[redact]
    pub refresh_token: String,

    /// Raw identity claims from the provider.
    #[serde(default)]
    pub user_info: UserInfo,
}

/// Payload of the refresh endpoint.
#[derive(Clone, Deserialize, Redact)]
pub struct RefreshData {
    #[redact]
    pub access_token: String,
}

/// OIDC-style identity claims as forwarded by the identity backend.
///
/// All fields are optional; a login must not fail because the provider
/// withheld a claim.
#[derive(Clone, Default, Deserialize, Serialize, Redact)]
pub struct UserInfo {
    /// Subject identifier.
    #[serde(default)]
    pub sub: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[redact]
    #[serde(default)]
    pub email: Option<String>,

    #[redact]
    #[serde(default)]
    pub phone_number: Option<String>,

    /// Backend account type, when the account has one.
    ///
    /// Known values are `normal_user`, `business_owner` and `advertiser`;
    /// anything else is treated as a plain user.
    #[serde(default)]
    pub user_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;

    #[test]
    fn parses_enveloped_authorize_response() {
        let body = r#"{
            "message": "Redirecting to Fayda Esignet",
            "data": { "auth_url": "https://idp/auth?x=1", "session_id": "S1" }
        }"#;
        let parsed: Envelope<AuthorizeData> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.session_id, "S1");
    }

    #[test]
    fn missing_claims_default_to_none() {
        let body = r#"{
            "data": {
                "access_token": "a",
                "refresh_token": "r",
                "user_info": { "sub": "user-1" }
            }
        }"#;
        let parsed: Envelope<AuthenticateData> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.user_info.sub.as_deref(), Some("user-1"));
        assert!(parsed.data.user_info.user_type.is_none());
    }

    #[test]
    fn claims_survive_absent_user_info() {
        let body = r#"{ "data": { "access_token": "a", "refresh_token": "r" } }"#;
        let parsed: Envelope<AuthenticateData> = serde_json::from_str(body).unwrap();
        assert!(parsed.data.user_info.sub.is_none());
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let request = AuthenticateRequest {
            session_id: "S1".to_string(),
            csrf_token: "very-secret-state".to_string(),
            auth_code: "very-secret-code".to_string(),
        };
        let debug = format!("{request:?}");
        assert!(!debug.contains("very-secret-state"));
        assert!(!debug.contains("very-secret-code"));
    }
}
