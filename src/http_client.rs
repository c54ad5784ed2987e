use anyhow::Context;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::auth::{error_message, Credential, HttpRefreshBackend, RefreshCoordinator};
use crate::config::{Config, REFRESH_COOKIE_NAME};
use crate::error::{ApiError, Fault, Result};
use crate::session::SessionStore;

/// Retry bookkeeping for one logical request.
/// Passed to each attempt instead of being stored on the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestAttempt {
    pub retried: bool,
}

impl RequestAttempt {
    pub fn first() -> Self {
        Self { retried: false }
    }

    /// The attempt replaying a request after a credential refresh
    pub fn replay(self) -> Self {
        Self { retried: true }
    }
}

/// HTTP client for the API that authenticates every request
///
/// Automatically handles:
/// - no credential in the session: obtains one through the refresh cookie
/// - 401: renews the credential (shared with concurrent requests) and retries once
#[derive(Clone)]
pub struct AuthenticatedClient {
    /// Shared HTTP client; its cookie jar holds the refresh cookie
    client: Client,

    /// API root every path is resolved against
    base_url: Url,

    coordinator: RefreshCoordinator,
}

impl AuthenticatedClient {
    /// Build the HTTP client, cookie jar and refresh coordinator from configuration
    pub fn new(config: &Config, session: Arc<dyn SessionStore>) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());

        if let Some(ref cookie) = config.refresh_cookie {
            let refresh_url = config
                .base_url
                .join("auth/refresh")
                .context("Failed to build refresh URL")?;
            jar.add_cookie_str(
                &format!(
                    "{}={}; Path={}",
                    REFRESH_COOKIE_NAME,
                    cookie,
                    refresh_url.path()
                ),
                &refresh_url,
            );
            tracing::debug!("Seeded cookie jar with refresh cookie");
        }

        let client = Client::builder()
            .cookie_provider(jar)
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        let backend = Arc::new(HttpRefreshBackend::new(client.clone(), &config.base_url)?);
        let coordinator = RefreshCoordinator::new(backend, session, config.refresh_timeout());

        Ok(Self::with_parts(client, config.base_url.clone(), coordinator))
    }

    /// Assemble a client from already built parts
    pub fn with_parts(client: Client, base_url: Url, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            base_url,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve a path against the API root
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid request path: {}", path))
            .map_err(ApiError::Internal)
    }

    /// Start building a request for a path under the API root
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.client.request(method, self.url(path)?))
    }

    pub fn get(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::DELETE, path)
    }

    /// Send a request with the session credential attached.
    ///
    /// A 401 is recovered once by renewing the credential; a second 401 is
    /// returned as [`ApiError::Unauthorized`]. Every other response is
    /// returned unchanged.
    pub async fn send(&self, request: Request) -> Result<Response> {
        if request.try_clone().is_none() {
            return Err(ApiError::NotReplayable);
        }

        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        tracing::debug!(
            request_id = %request_id,
            method = %request.method(),
            url = %request.url(),
            "Sending authenticated request"
        );

        let mut credential = match self.coordinator.session().read() {
            Some(credential) => credential,
            None => {
                tracing::debug!(request_id = %request_id, "No credential in session, obtaining one");
                self.coordinator.ensure_fresh_credential().await?
            }
        };

        let mut attempt = RequestAttempt::first();

        loop {
            let response = self
                .dispatch(&request, &credential, attempt, &request_id)
                .await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            if attempt.retried {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(
                    request_id = %request_id,
                    url = %request.url(),
                    "Received 401 again after refreshing, giving up"
                );
                return Err(ApiError::Unauthorized {
                    status: StatusCode::UNAUTHORIZED.as_u16(),
                    message: error_message(&body),
                });
            }

            tracing::warn!(
                request_id = %request_id,
                token = %credential.redacted(),
                token_age_secs = credential.age().num_seconds(),
                "Received 401, renewing credential and retrying..."
            );

            attempt = attempt.replay();
            credential = match self.coordinator.renew_rejected(&credential).await {
                Ok(credential) => credential,
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Credential renewal failed");
                    return Err(ApiError::Auth(e));
                }
            };
        }
    }

    /// Send a request and decode a successful JSON response.
    /// Non-success statuses become [`ApiError::Status`].
    pub async fn send_json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let response = self.send(request).await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = error_message(&String::from_utf8_lossy(&body));
            return Err(ApiError::Status {
                status: status.as_u16(),
                fault: Fault::from_status(status),
                message,
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }

    /// GET a path and decode its JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.get(path)?.build()?;
        self.send_json(request).await
    }

    /// Clear the session and tell the server to drop the refresh cookie
    pub async fn sign_out(&self) -> Result<()> {
        self.coordinator.sign_out();

        let response = self.client.post(self.url("auth/logout")?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                fault: Fault::from_status(status),
                message: error_message(&body),
            });
        }

        Ok(())
    }

    /// Execute one attempt of a request with the given credential
    async fn dispatch(
        &self,
        request: &Request,
        credential: &Credential,
        attempt: RequestAttempt,
        request_id: &str,
    ) -> Result<Response> {
        let mut req = request.try_clone().ok_or(ApiError::NotReplayable)?;

        let mut value = HeaderValue::from_str(&credential.bearer()).map_err(|e| {
            ApiError::Internal(anyhow::anyhow!(
                "Access token is not a valid header value: {}",
                e
            ))
        })?;
        value.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, value);

        tracing::debug!(
            request_id = %request_id,
            retried = attempt.retried,
            token = %credential.redacted(),
            "Executing request attempt"
        );

        match self.client.execute(req).await {
            Ok(response) => {
                tracing::debug!(
                    request_id = %request_id,
                    status = %response.status(),
                    "Received HTTP response"
                );
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    error_kind = transport_error_kind(&e),
                    error = %e,
                    url = %request.url(),
                    "HTTP request error"
                );
                Err(ApiError::Transport(e))
            }
        }
    }
}

/// Categorize a transport error for logging
fn transport_error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
