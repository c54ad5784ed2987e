// Integration tests for the authenticated request pipeline
//
// These tests run the real HTTP refresh backend, cookie jar and dispatcher
// against a mock API served by axum on an ephemeral port.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use romantic_client::{
    config::Config, ApiError, AuthError, AuthenticatedClient, Credential, Identity,
    MemorySessionStore, RefreshState, SessionStore,
};

// ==================================================================================================
// Mock API
// ==================================================================================================

/// Access token the mock API accepts
const VALID_TOKEN: &str = "T2";

/// Shared state of the mock API
struct MockApi {
    refresh_calls: AtomicUsize,
    refresh_delay: Duration,
    refresh_fails: AtomicBool,

    /// Refresh token the API currently accepts; rotated on every refresh
    refresh_token: Mutex<String>,
    rotations: AtomicUsize,

    denied_hits: AtomicUsize,
}

impl MockApi {
    fn new(refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            refresh_delay,
            refresh_fails: AtomicBool::new(false),
            refresh_token: Mutex::new("rt-0".to_string()),
            rotations: AtomicUsize::new(0),
            denied_hits: AtomicUsize::new(0),
        })
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "code": status.as_u16(),
            "status": status.canonical_reason().unwrap_or_default(),
            "message": message,
        })),
    )
        .into_response()
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

async fn handle_refresh(State(api): State<Arc<MockApi>>, headers: HeaderMap) -> Response {
    api.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(api.refresh_delay).await;

    if api.refresh_fails.load(Ordering::SeqCst) {
        return error_body(StatusCode::BAD_REQUEST, "Refresh token is malformed");
    }

    let presented = headers
        .get("x-refresh-token")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| cookie(&headers, "WAUTHREF"));

    let next = {
        let mut current = api.refresh_token.lock().unwrap();
        if presented.as_deref() != Some(current.as_str()) {
            return error_body(StatusCode::UNAUTHORIZED, "Refresh token cannot be used");
        }
        let next = format!("rt-{}", api.rotations.fetch_add(1, Ordering::SeqCst) + 1);
        *current = next.clone();
        next
    };

    (
        [(
            header::SET_COOKIE,
            format!(
                "WAUTHREF={}; Path=/api/v1/auth/refresh; HttpOnly; SameSite=Strict",
                next
            ),
        )],
        Json(json!({"code": 200, "status": "OK", "accessToken": VALID_TOKEN})),
    )
        .into_response()
}

async fn handle_authorize(headers: HeaderMap) -> Response {
    match bearer(&headers) {
        Some(token) if token == VALID_TOKEN => {
            Json(json!({"code": 200, "status": "OK", "auth": true})).into_response()
        }
        _ => error_body(StatusCode::UNAUTHORIZED, "Signature has expired"),
    }
}

async fn handle_user(headers: HeaderMap) -> Response {
    match bearer(&headers) {
        Some(token) if token == VALID_TOKEN => Json(json!({
            "code": 200,
            "status": "OK",
            "user": {
                "uid": "u-1",
                "name": "Hana",
                "email": "hana@example.com",
                "role": ["core:user"],
                "profile_picture": ""
            }
        }))
        .into_response(),
        _ => error_body(StatusCode::UNAUTHORIZED, "Signature has expired"),
    }
}

async fn handle_plan(headers: HeaderMap) -> Response {
    match bearer(&headers) {
        Some(token) if token == VALID_TOKEN => {
            Json(json!({"code": 200, "status": "OK", "token": token})).into_response()
        }
        _ => error_body(StatusCode::UNAUTHORIZED, "Signature has expired"),
    }
}

async fn handle_denied(State(api): State<Arc<MockApi>>) -> Response {
    api.denied_hits.fetch_add(1, Ordering::SeqCst);
    error_body(StatusCode::UNAUTHORIZED, "Not a member of this plan")
}

async fn handle_missing() -> Response {
    error_body(StatusCode::NOT_FOUND, "Place was not found")
}

/// Serve the mock API and return its base URL
async fn start_mock_api(api: Arc<MockApi>) -> String {
    let app = Router::new()
        .route("/api/v1/auth/refresh", post(handle_refresh))
        .route("/api/v1/auth/authorize", get(handle_authorize))
        .route("/api/v1/user", get(handle_user))
        .route("/api/v1/plan", get(handle_plan))
        .route("/api/v1/plan/denied", get(handle_denied))
        .route("/api/v1/place/missing", get(handle_missing))
        .with_state(api);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://127.0.0.1:{}/api/v1", port)
}

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn expired_credential() -> Credential {
    Credential::new(
        "T1".to_string(),
        Identity {
            uid: "u-1".to_string(),
            name: "Hana".to_string(),
            role: vec!["core:user".to_string()],
            profile_picture: String::new(),
        },
    )
}

/// Client whose cookie jar holds the mock API's initial refresh cookie
fn build_client(base_url: &str, session: &MemorySessionStore) -> AuthenticatedClient {
    let mut config = Config::for_base_url(base_url).expect("valid base URL");
    config.refresh_cookie = Some("rt-0".to_string());
    config.token_refresh_timeout = 5;

    AuthenticatedClient::new(&config, Arc::new(session.clone())).expect("client")
}

async fn fire_concurrently(
    client: &AuthenticatedClient,
    path: &'static str,
    count: usize,
) -> Vec<Result<reqwest::Response, ApiError>> {
    let handles: Vec<_> = (0..count)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                let request = client.get(path).unwrap().build().unwrap();
                client.send(request).await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(count);
    for handle in handles {
        results.push(handle.await.expect("request task panicked"));
    }
    results
}

// ==================================================================================================
// Single-flight Tests
// ==================================================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_expiry_triggers_one_refresh() {
    let api = MockApi::new(Duration::from_millis(50));
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::with_credential(expired_credential());
    let client = build_client(&base_url, &session);

    let results = fire_concurrently(&client, "plan", 5).await;

    for result in results {
        let response = result.expect("request should succeed after refresh");
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["token"], VALID_TOKEN);
    }

    assert_eq!(api.refresh_calls(), 1);
    assert_eq!(session.read().unwrap().access_token, VALID_TOKEN);
    assert_eq!(client.coordinator().state(), RefreshState::Idle);
    assert_eq!(client.coordinator().pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_client_fault_rejects_all_waiters() {
    let api = MockApi::new(Duration::from_millis(100));
    api.refresh_fails.store(true, Ordering::SeqCst);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::with_credential(expired_credential());
    let client = build_client(&base_url, &session);

    let results = fire_concurrently(&client, "plan", 5).await;

    let expected = AuthError::ClientFault {
        status: 400,
        message: "Refresh token is malformed".to_string(),
    };
    for result in results {
        match result {
            Err(ApiError::Auth(e)) => assert_eq!(e, expected),
            other => panic!("expected refresh failure, got {:?}", other.map(|r| r.status())),
        }
    }

    assert_eq!(api.refresh_calls(), 1);
    assert!(session.read().is_none());
    assert_eq!(client.coordinator().state(), RefreshState::Idle);
}

#[tokio::test]
async fn test_new_refresh_after_failed_settlement() {
    let api = MockApi::new(Duration::from_millis(10));
    api.refresh_fails.store(true, Ordering::SeqCst);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::with_credential(expired_credential());
    let client = build_client(&base_url, &session);

    let request = client.get("plan").unwrap().build().unwrap();
    assert!(client.send(request).await.is_err());
    assert_eq!(client.coordinator().state(), RefreshState::Idle);

    // Cold start from an empty session starts a brand new refresh
    api.refresh_fails.store(false, Ordering::SeqCst);
    let request = client.get("plan").unwrap().build().unwrap();
    let response = client.send(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(api.refresh_calls(), 2);
}

// ==================================================================================================
// Retry Policy Tests
// ==================================================================================================

#[tokio::test]
async fn test_repeated_unauthorized_gets_exactly_two_attempts() {
    let api = MockApi::new(Duration::ZERO);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::with_credential(expired_credential());
    let client = build_client(&base_url, &session);

    let request = client.get("plan/denied").unwrap().build().unwrap();
    let err = client.send(request).await.unwrap_err();

    assert!(matches!(err, ApiError::Unauthorized { status: 401, .. }));
    assert!(err.requires_sign_in());
    assert_eq!(api.denied_hits.load(Ordering::SeqCst), 2);
    assert_eq!(api.refresh_calls(), 1);
}

#[tokio::test]
async fn test_fresh_credential_is_reused() {
    let api = MockApi::new(Duration::ZERO);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::with_credential(expired_credential());
    let client = build_client(&base_url, &session);

    for _ in 0..3 {
        let request = client.get("plan").unwrap().build().unwrap();
        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(api.refresh_calls(), 1);
    assert_eq!(session.read().unwrap().identity.name, "Hana");
}

#[tokio::test]
async fn test_non_auth_errors_are_not_retried() {
    let api = MockApi::new(Duration::ZERO);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::new();
    let client = build_client(&base_url, &session);
    client.coordinator().sign_in(VALID_TOKEN).await.unwrap();

    let request = client.get("place/missing").unwrap().build().unwrap();
    let response = client.send(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(api.refresh_calls(), 0);
}

// ==================================================================================================
// Refresh Credential Tests
// ==================================================================================================

#[tokio::test]
async fn test_refresh_cookie_is_rotated() {
    let api = MockApi::new(Duration::ZERO);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::new();
    let client = build_client(&base_url, &session);

    // The mock rejects reuse of a consumed refresh token, so the second
    // refresh only succeeds if the jar picked up the rotated cookie
    client.coordinator().force_refresh().await.unwrap();
    client.coordinator().force_refresh().await.unwrap();

    assert_eq!(api.refresh_calls(), 2);
    assert_eq!(*api.refresh_token.lock().unwrap(), "rt-2");
}

#[tokio::test]
async fn test_explicit_refresh_token_sign_in() {
    let api = MockApi::new(Duration::ZERO);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::new();
    let config = Config::for_base_url(&base_url).unwrap();
    let client = AuthenticatedClient::new(&config, Arc::new(session.clone())).unwrap();

    let credential = client.coordinator().force_refresh_with("rt-0").await.unwrap();

    assert_eq!(credential.access_token, VALID_TOKEN);
    assert_eq!(credential.identity.uid, "u-1");
    assert_eq!(session.read().unwrap(), credential);
}

#[tokio::test]
async fn test_missing_refresh_cookie_fails_cold_start() {
    let api = MockApi::new(Duration::ZERO);
    let base_url = start_mock_api(api.clone()).await;
    let session = MemorySessionStore::new();
    let config = Config::for_base_url(&base_url).unwrap();
    let client = AuthenticatedClient::new(&config, Arc::new(session.clone())).unwrap();

    let request = client.get("plan").unwrap().build().unwrap();
    let err = client.send(request).await.unwrap_err();

    match err {
        ApiError::Auth(e) => assert!(e.is_client_fault()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(session.read().is_none());
}
