use anyhow::{Context, Result};
use futures::future::join_all;
use reqwest::StatusCode;
use std::sync::Arc;

use romantic_client::config::{prompt_refresh_token, Config, RequestPlan};
use romantic_client::{ApiError, AuthenticatedClient, MemorySessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, plan) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::info!("Romantic client starting...");
    tracing::debug!("API base URL: {}", config.base_url);

    let session = MemorySessionStore::new();
    spawn_session_observer(&session);

    let client = AuthenticatedClient::new(&config, Arc::new(session.clone()))?;

    let refresh_token = match config.refresh_token.clone() {
        Some(token) => Some(token),
        None if plan.login => Some(prompt_refresh_token()?),
        None => None,
    };

    if let Some(token) = refresh_token {
        match client.coordinator().force_refresh_with(token).await {
            Ok(credential) => {
                tracing::info!(
                    "Signed in as {} ({})",
                    credential.identity.name,
                    credential.identity.uid
                );
            }
            Err(e) => {
                tracing::error!("Sign-in failed: {}", e);
                anyhow::bail!("Unable to sign in with the provided refresh token");
            }
        }
    }

    // Requests go out concurrently and share any refresh they trigger
    let results = join_all(plan.paths.iter().map(|path| send_one(&client, &plan, path))).await;

    let mut failures = 0;
    for (path, result) in plan.paths.iter().zip(results) {
        match result {
            Ok((status, body)) => {
                println!("{} {} -> {}", plan.method, path, status);
                if !body.is_empty() {
                    println!("{}", body);
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("{} {} failed: {}", plan.method, path, e);
                if e.requires_sign_in() {
                    eprintln!("  Sign in again with --login or --refresh-token");
                }
            }
        }
    }

    if plan.logout {
        client.sign_out().await.context("Sign-out failed")?;
    }

    if failures > 0 {
        anyhow::bail!("{} of {} requests failed", failures, plan.paths.len());
    }

    Ok(())
}

/// Send one planned request and return its status and (pretty-printed) body
async fn send_one(
    client: &AuthenticatedClient,
    plan: &RequestPlan,
    path: &str,
) -> Result<(StatusCode, String), ApiError> {
    let mut builder = client.request(plan.method.clone(), path)?;
    if let Some(ref body) = plan.body {
        builder = builder.json(body);
    }

    let response = client.send(builder.build()?).await?;
    let status = response.status();
    let body = response.text().await?;

    Ok((status, pretty_json(body)))
}

/// Pretty-print JSON bodies, leaving anything else untouched
fn pretty_json(body: String) -> String {
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or(body)
}

/// Log sign-in and sign-out transitions of the session
fn spawn_session_observer(session: &MemorySessionStore) {
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            match rx.borrow_and_update().as_ref() {
                Some(credential) => tracing::info!(
                    uid = %credential.identity.uid,
                    token = %credential.redacted(),
                    "Access token updated"
                ),
                None => tracing::info!("Session signed out"),
            }
        }
    });
}
