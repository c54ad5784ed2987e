use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use reqwest::{Method, Url};
use std::time::Duration;

/// Default API root of a locally running service
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api/v1/";

/// Name of the http-only refresh cookie set by the auth endpoints
pub const REFRESH_COOKIE_NAME: &str = "WAUTHREF";

/// Romantic API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Refresh token used to sign in before sending requests
    #[arg(short = 'r', long, env = "REFRESH_TOKEN")]
    pub refresh_token: Option<String>,

    /// Value of the refresh cookie to seed the cookie jar with
    #[arg(long, env = "REFRESH_COOKIE")]
    pub refresh_cookie: Option<String>,

    /// Prompt for a refresh token when none is configured
    #[arg(long)]
    pub login: bool,

    /// Sign out after the requests complete
    #[arg(long)]
    pub logout: bool,

    /// HTTP method for the requests
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// JSON body sent with every request
    #[arg(short = 'd', long)]
    pub data: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "5")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "10")]
    pub http_timeout: u64,

    /// Token refresh timeout in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "10")]
    pub refresh_timeout: u64,

    /// Paths to request, relative to the base URL
    pub paths: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub base_url: Url,

    // Credentials
    pub refresh_token: Option<String>,
    pub refresh_cookie: Option<String>,

    // Timeouts (seconds)
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub token_refresh_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

/// Requests the CLI was asked to send
#[derive(Clone, Debug)]
pub struct RequestPlan {
    pub method: Method,
    pub paths: Vec<String>,
    pub body: Option<serde_json::Value>,
    pub login: bool,
    pub logout: bool,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, RequestPlan)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();

        let config = Config {
            base_url: normalize_base_url(&args.base_url)?,
            refresh_token: args.refresh_token.filter(|t| !t.is_empty()),
            refresh_cookie: args.refresh_cookie.filter(|c| !c.is_empty()),
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
            token_refresh_timeout: args.refresh_timeout,
            log_level: args.log_level,
            log_format: args.log_format.to_lowercase(),
        };

        let plan = RequestPlan {
            method: parse_method(&args.method)?,
            paths: args.paths,
            body: args
                .data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("--data must be valid JSON")?,
            login: args.login,
            logout: args.logout,
        };

        Ok((config, plan))
    }

    /// Configuration with defaults for the given API root
    pub fn for_base_url(base_url: &str) -> Result<Self> {
        Ok(Config {
            base_url: normalize_base_url(base_url)?,
            refresh_token: None,
            refresh_cookie: None,
            http_connect_timeout: 5,
            http_request_timeout: 10,
            token_refresh_timeout: 10,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.base_url.scheme(), "http" | "https") {
            anyhow::bail!(
                "API_BASE_URL must use http or https: {}",
                self.base_url
            );
        }

        if self.http_connect_timeout == 0
            || self.http_request_timeout == 0
            || self.token_refresh_timeout == 0
        {
            anyhow::bail!(
                "HTTP_CONNECT_TIMEOUT, HTTP_REQUEST_TIMEOUT and TOKEN_REFRESH_TIMEOUT must be positive"
            );
        }

        if !matches!(self.log_format.as_str(), "text" | "json") {
            anyhow::bail!("LOG_FORMAT must be text or json: {}", self.log_format);
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.token_refresh_timeout)
    }
}

/// Parse a base URL, making sure relative paths join below it
fn normalize_base_url(s: &str) -> Result<Url> {
    let mut url = Url::parse(s).with_context(|| format!("Invalid API_BASE_URL: {}", s))?;

    if url.cannot_be_a_base() {
        anyhow::bail!("API_BASE_URL cannot be used as a base: {}", s);
    }

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

/// Parse an HTTP method name, case-insensitively
fn parse_method(s: &str) -> Result<Method> {
    Method::from_bytes(s.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", s))
}

/// Ask the user for a refresh token
pub fn prompt_refresh_token() -> Result<String> {
    let token: String = Password::new()
        .with_prompt("Refresh token")
        .interact()
        .context("Failed to read refresh token")?;

    if token.is_empty() {
        anyhow::bail!("Refresh token cannot be empty");
    }

    Ok(token)
}
