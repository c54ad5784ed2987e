// Error handling module
// Defines the refresh and request error taxonomy

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of an HTTP error status, used by callers to decide
/// which error page or prompt to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    Forbidden,
    ClientFault,
    ServerFault,
    UnknownFault,
}

impl Fault {
    /// Classify an HTTP status code
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 | 406 | 422 => Fault::ClientFault,
            404 | 405 => Fault::NotFound,
            401 | 403 => Fault::Forbidden,
            500 => Fault::ServerFault,
            _ => Fault::UnknownFault,
        }
    }
}

/// Outcome of a failed refresh attempt.
///
/// Every caller waiting on the same refresh receives a clone of the same value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// The refresh credential was malformed or missing (400)
    #[error("Refresh rejected: {status} - {message}")]
    ClientFault { status: u16, message: String },

    /// The refresh credential or the new bearer token was not accepted (401)
    #[error("Credential not authorized: {0}")]
    Unauthorized(String),

    /// The auth server failed for a reason unrelated to the credential
    #[error("Auth server error: {status} - {message}")]
    ServerFault { status: u16, message: String },

    /// The auth server answered with a body we could not understand
    #[error("Malformed auth response: {0}")]
    Malformed(String),

    /// The refresh request never produced a response
    #[error("Transport error during refresh: {0}")]
    Transport(String),

    #[error("Token refresh timed out after {0:?}")]
    Timeout(Duration),

    /// The task running the refresh ended without settling
    #[error("Token refresh interrupted")]
    Interrupted,

    /// The session was signed out while the refresh was in flight
    #[error("Signed out during token refresh")]
    SignedOut,
}

impl AuthError {
    /// Map an auth endpoint's error status to a refresh error
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            400 => AuthError::ClientFault {
                status: 400,
                message,
            },
            401 => AuthError::Unauthorized(message),
            code => AuthError::ServerFault {
                status: code,
                message,
            },
        }
    }

    /// Whether the failure is attributable to the credential itself, meaning
    /// the user has to sign in again rather than simply retry later.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            AuthError::ClientFault { .. } | AuthError::Unauthorized(_)
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthError::Malformed(err.to_string())
        } else {
            AuthError::Transport(err.to_string())
        }
    }
}

/// Errors surfaced by the authenticated request pipeline
#[derive(Error, Debug)]
pub enum ApiError {
    /// The credential could not be refreshed; the caller should sign in again
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The request was rejected again after a successful refresh
    #[error("Unauthorized after refresh: {status} - {message}")]
    Unauthorized { status: u16, message: String },

    /// Non-success response returned by a typed helper
    #[error("API error: {status} - {message}")]
    Status {
        status: u16,
        fault: Fault,
        message: String,
    },

    /// The request could not be sent or the response could not be read
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Streaming bodies cannot be replayed after a refresh
    #[error("Request body is not replayable")]
    NotReplayable,

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Classification for display purposes
    pub fn fault(&self) -> Fault {
        match self {
            ApiError::Auth(_) | ApiError::Unauthorized { .. } => Fault::Forbidden,
            ApiError::Status { fault, .. } => *fault,
            ApiError::NotReplayable => Fault::ClientFault,
            _ => Fault::UnknownFault,
        }
    }

    /// Whether the caller should route the user to a sign-in flow
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, ApiError::Auth(_) | ApiError::Unauthorized { .. })
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
