// Token refresh and identity verification

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, Url};

use super::types::{AuthorizeResponse, Identity, RefreshResponse, UserResponse};
use crate::error::AuthError;

/// Header carrying an explicitly supplied refresh token
pub const REFRESH_TOKEN_HEADER: &str = "X-Refresh-Token";

/// Network operations performed by the owner of a refresh
#[async_trait]
pub trait RefreshBackend: Send + Sync {
    /// Exchange a refresh credential for a new bearer token.
    /// `None` presents the implicit refresh cookie.
    async fn refresh(&self, refresh_token: Option<&str>) -> std::result::Result<String, AuthError>;

    /// Validate a bearer token and fetch the identity it belongs to
    async fn verify(&self, access_token: &str) -> std::result::Result<Identity, AuthError>;
}

/// Refresh backend talking to the auth endpoints of the API
pub struct HttpRefreshBackend {
    /// Shared client; its cookie jar holds the refresh cookie
    client: Client,

    refresh_url: Url,
    authorize_url: Url,
    user_url: Url,
}

impl HttpRefreshBackend {
    /// Create a backend for the API rooted at `base_url`
    pub fn new(client: Client, base_url: &Url) -> Result<Self> {
        Ok(Self {
            client,
            refresh_url: base_url
                .join("auth/refresh")
                .context("Failed to build refresh URL")?,
            authorize_url: base_url
                .join("auth/authorize")
                .context("Failed to build authorize URL")?,
            user_url: base_url.join("user").context("Failed to build user URL")?,
        })
    }

    async fn get_with_bearer(
        &self,
        url: &Url,
        access_token: &str,
    ) -> std::result::Result<Response, AuthError> {
        let response = self
            .client
            .get(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .send()
            .await?;

        ensure_success(response).await
    }
}

#[async_trait]
impl RefreshBackend for HttpRefreshBackend {
    async fn refresh(&self, refresh_token: Option<&str>) -> std::result::Result<String, AuthError> {
        tracing::debug!(
            url = %self.refresh_url,
            explicit = refresh_token.is_some(),
            "Requesting new access token"
        );

        let mut request = self.client.post(self.refresh_url.clone());
        if let Some(token) = refresh_token {
            request = request.header(REFRESH_TOKEN_HEADER, format!("Bearer {}", token));
        }

        let response = ensure_success(request.send().await?).await?;
        let data: RefreshResponse = response.json().await?;

        if data.access_token.is_empty() {
            return Err(AuthError::Malformed(
                "refresh response does not contain accessToken".to_string(),
            ));
        }

        Ok(data.access_token)
    }

    async fn verify(&self, access_token: &str) -> std::result::Result<Identity, AuthError> {
        let response = self
            .get_with_bearer(&self.authorize_url, access_token)
            .await?;
        let authorize: AuthorizeResponse = response.json().await?;
        if !authorize.auth {
            return Err(AuthError::Unauthorized(
                "access token was not authorized".to_string(),
            ));
        }

        let response = self.get_with_bearer(&self.user_url, access_token).await?;
        let user: UserResponse = response.json().await?;

        tracing::debug!(uid = %user.user.uid, "Access token verified");
        Ok(user.user)
    }
}

/// Turn a non-success auth response into a classified error
async fn ensure_success(response: Response) -> std::result::Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);

    tracing::warn!(
        status = status.as_u16(),
        url = %url,
        message = %message,
        "Auth endpoint returned error"
    );

    Err(AuthError::from_status(status, message))
}

/// Extract the `message` field of an API error body, falling back to the raw text
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("detail"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}
