// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity associated with a bearer token, as returned by the user endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(alias = "uuid")]
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub role: Vec<String>,
    #[serde(default)]
    pub profile_picture: String,
}

impl Identity {
    /// Check whether the identity carries a role (e.g. `place:add`)
    pub fn has_role(&self, role: &str) -> bool {
        self.role.iter().any(|r| r == role)
    }
}

/// Bearer token plus the identity it authorizes.
/// Replaced wholesale on refresh, never mutated.
///
/// Equality ignores `issued_at`: the same token for the same identity is the
/// same credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub identity: Identity,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: String, identity: Identity) -> Self {
        Self {
            access_token,
            identity,
            issued_at: Utc::now(),
        }
    }

    /// Value for the Authorization header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Token prefix safe to put in logs
    pub fn redacted(&self) -> String {
        redact(&self.access_token)
    }

    /// Time since this credential was obtained
    pub fn age(&self) -> Duration {
        Utc::now() - self.issued_at
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.access_token == other.access_token && self.identity == other.identity
    }
}

/// Shorten a secret to its first 8 characters for log output
pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

/// Where the owner of a refresh gets its bearer token from
#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    /// Implicit http-only refresh cookie held by the cookie jar
    Cookie,

    /// Refresh token supplied explicitly by the user
    RefreshToken(String),

    /// Bearer token produced by a sign-in flow; only needs verification
    AccessToken(String),
}

impl Grant {
    pub fn kind(&self) -> &'static str {
        match self {
            Grant::Cookie => "cookie",
            Grant::RefreshToken(_) => "refresh_token",
            Grant::AccessToken(_) => "access_token",
        }
    }
}

/// Refresh state machine of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Refresh endpoint response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
}

/// Authorize endpoint response
#[derive(Debug, Deserialize)]
pub struct AuthorizeResponse {
    #[serde(default)]
    pub auth: bool,
}

/// User endpoint response
#[derive(Debug, Deserialize)]
pub struct UserResponse {
    pub user: Identity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_response_ignores_extra_fields() {
        let body = r#"{
            "code": 200,
            "status": "OK",
            "user": {
                "uid": "8c1f",
                "name": "Hana",
                "email": "hana@example.com",
                "sex": 1,
                "role": ["core:user", "place:add"],
                "profile_picture": "p.png"
            }
        }"#;

        let resp: UserResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.user.uid, "8c1f");
        assert!(resp.user.has_role("place:add"));
        assert!(!resp.user.has_role("core:root"));
    }

    #[test]
    fn test_identity_accepts_uuid_alias() {
        let identity: Identity =
            serde_json::from_str(r#"{"uuid": "abc", "name": "Min"}"#).unwrap();
        assert_eq!(identity.uid, "abc");
        assert!(identity.role.is_empty());
        assert_eq!(identity.profile_picture, "");
    }

    #[test]
    fn test_refresh_response_camel_case() {
        let resp: RefreshResponse =
            serde_json::from_str(r#"{"code":200,"status":"OK","accessToken":"T2"}"#).unwrap();
        assert_eq!(resp.access_token, "T2");
    }

    #[test]
    fn test_authorize_response_defaults_to_false() {
        let resp: AuthorizeResponse = serde_json::from_str(r#"{"code":200}"#).unwrap();
        assert!(!resp.auth);
    }

    #[test]
    fn test_redacted_token() {
        let cred = Credential::new(
            "eyJhbGciOiJIUzI1NiJ9.payload".to_string(),
            Identity {
                uid: "u".to_string(),
                name: "n".to_string(),
                role: vec![],
                profile_picture: String::new(),
            },
        );
        assert_eq!(cred.redacted(), "eyJhbGci...");
        assert_eq!(cred.bearer(), "Bearer eyJhbGciOiJIUzI1NiJ9.payload");
        assert_eq!(redact("abc"), "abc...");
    }

    #[test]
    fn test_credential_equality_ignores_issue_time() {
        let identity = Identity {
            uid: "u".to_string(),
            name: "n".to_string(),
            role: vec![],
            profile_picture: String::new(),
        };
        let first = Credential::new("T2".to_string(), identity.clone());
        let mut second = Credential::new("T2".to_string(), identity.clone());
        second.issued_at = first.issued_at - Duration::minutes(5);

        assert_eq!(first, second);
        assert!(second.age() >= Duration::minutes(5));
        assert_ne!(first, Credential::new("T3".to_string(), identity));
    }
}
