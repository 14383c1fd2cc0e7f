//! Configuration parsing and validation
//!
//! `Config` is what clap reads from the command line and environment.
//! `Settings` is the validated form the rest of the crate consumes.

use crate::cache::MAX_TTL;
use crate::error::{PipelineError, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_SCOPES: &str = "openid profile email";
const DEFAULT_REDIRECT_URL: &str = "http://localhost:5000/signin-oidc";
const DEFAULT_COOKIE_TTL_SECS: u64 = 1200;
pub const DEFAULT_CAPTURE_TTL_SECS: u64 = 300;
const DEFAULT_IDP_TIMEOUT_SECS: u64 = 10;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "oidc-pipeline",
    version,
    about = "OpenID Connect relying party with one-time response capture",
    long_about = "Relying party that captures identity provider responses under single-use correlation keys, redeems them into cookie sessions and validates those sessions on every request"
)]
pub struct Config {
    /// Application name, used as the cookie name prefix
    #[arg(long, env = "APPLICATION_NAME", default_value = "OidcPipeline")]
    pub application_name: String,

    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:5000")]
    pub bind: String,

    /// OIDC issuer URL (e.g., https://auth.example.com)
    #[arg(long, env = "OIDC_ISSUER_URL")]
    pub oidc_issuer_url: String,

    /// OAuth client ID
    #[arg(long, env = "OIDC_CLIENT_ID")]
    pub oidc_client_id: String,

    /// OAuth client secret (optional for public clients)
    #[arg(long, env = "OIDC_CLIENT_SECRET")]
    pub oidc_client_secret: Option<String>,

    /// Space-separated OAuth scopes (default: "openid profile email")
    #[arg(long, env = "OIDC_SCOPES")]
    pub oidc_scopes: Option<String>,

    /// Callback URL registered with the provider (default: http://localhost:5000/signin-oidc)
    #[arg(long, env = "OIDC_REDIRECT_URL")]
    pub oidc_redirect_url: Option<String>,

    /// Name recorded as the login provider of sessions created through this provider
    #[arg(long, env = "OIDC_LOGIN_PROVIDER", default_value = "oidc")]
    pub login_provider: String,

    /// Idle timeout of the authentication and session cookies, in seconds
    #[arg(long, env = "AUTH_AND_SESSION_COOKIES_TTL", default_value_t = DEFAULT_COOKIE_TTL_SECS.to_string())]
    pub cookie_ttl: String,

    /// Lifetime of an unredeemed OIDC capture, in seconds
    #[arg(long, env = "OIDC_CAPTURE_TTL", default_value_t = DEFAULT_CAPTURE_TTL_SECS)]
    pub capture_ttl: u64,

    /// Timeout for identity provider requests, in seconds
    #[arg(long, env = "OIDC_TIMEOUT", default_value_t = DEFAULT_IDP_TIMEOUT_SECS)]
    pub idp_timeout: u64,

    #[arg(long, env = "LOGIN_PATH", default_value = "/account/login")]
    pub login_path: String,

    #[arg(long, env = "LOGOUT_PATH", default_value = "/account/logout")]
    pub logout_path: String,

    #[arg(long, env = "ACCESS_DENIED_PATH", default_value = "/account/access-denied")]
    pub access_denied_path: String,

    /// Requests under this prefix get status codes instead of redirects
    #[arg(long, env = "API_PREFIX", default_value = "/api")]
    pub api_prefix: String,

    /// External URLs that may receive forwarded id token responses
    #[arg(long = "allowed-return-url", env = "ALLOWED_RETURN_URLS", value_delimiter = ',')]
    pub allowed_return_urls: Vec<String>,

    /// Don't show the startup banner
    #[arg(long)]
    pub no_banner: bool,

    /// Show only error messages
    #[arg(long, conflicts_with = "debug")]
    pub silent: bool,

    /// Enable debug logging
    #[arg(long, env = "OIDC_PIPELINE_DEBUG")]
    pub debug: bool,
}

/// Identity provider registration
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub redirect_url: String,
}

/// Endpoint paths of the relying party
#[derive(Debug, Clone)]
pub struct AuthPaths {
    pub login: String,
    pub logout: String,
    pub access_denied: String,
    /// Provider callback; the path of the redirect URL
    pub callback: String,
    pub challenge: String,
    /// Where capture keys are redeemed
    pub complete: String,
}

impl Default for AuthPaths {
    fn default() -> Self {
        Self {
            login: "/account/login".to_string(),
            logout: "/account/logout".to_string(),
            access_denied: "/account/access-denied".to_string(),
            callback: "/signin-oidc".to_string(),
            challenge: "/oidc/challenge".to_string(),
            complete: "/oidc/complete".to_string(),
        }
    }
}

/// Validated configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub application_name: String,
    pub bind_addr: SocketAddr,
    pub provider: ProviderSettings,
    pub cookie_ttl: Duration,
    pub capture_ttl: Duration,
    pub idp_timeout: Duration,
    pub paths: AuthPaths,
    pub api_prefix: String,
    pub allowed_return_urls: Vec<String>,
}

impl Settings {
    /// Settings with defaults for everything but the application and provider
    pub fn new(application_name: impl Into<String>, provider: ProviderSettings) -> Self {
        let mut paths = AuthPaths::default();
        if let Ok(url) = url::Url::parse(&provider.redirect_url) {
            paths.callback = url.path().to_string();
        }
        Self {
            application_name: application_name.into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            provider,
            cookie_ttl: Duration::from_secs(DEFAULT_COOKIE_TTL_SECS),
            capture_ttl: Duration::from_secs(DEFAULT_CAPTURE_TTL_SECS),
            idp_timeout: Duration::from_secs(DEFAULT_IDP_TIMEOUT_SECS),
            paths,
            api_prefix: "/api".to_string(),
            allowed_return_urls: Vec::new(),
        }
    }

    pub fn auth_cookie_name(&self) -> String {
        format!("{}.Identity.Application", self.application_name)
    }

    pub fn session_cookie_name(&self) -> String {
        format!("{}.Session", self.application_name)
    }

    /// Local paths are always allowed; absolute URLs must be registered
    pub fn is_allowed_return_url(&self, target: &str) -> bool {
        if target.starts_with('/') {
            return !target.starts_with("//") && !target.starts_with("/\\");
        }
        self.allowed_return_urls.iter().any(|allowed| allowed == target)
    }
}

impl Config {
    /// Parse configuration from CLI arguments and environment variables
    pub fn parse_args() -> Self {
        Config::parse()
    }

    /// Validate the configuration into [`Settings`]
    pub fn validate(&self) -> Result<Settings> {
        if self.application_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "Application name is required".to_string(),
            ));
        }

        if self.oidc_issuer_url.is_empty() {
            return Err(PipelineError::Config(
                "OIDC issuer URL is required".to_string(),
            ));
        }

        if self.oidc_client_id.is_empty() {
            return Err(PipelineError::Config("OIDC client ID is required".to_string()));
        }

        url::Url::parse(&self.oidc_issuer_url)
            .map_err(|e| PipelineError::Config(format!("Invalid OIDC issuer URL: {}", e)))?;

        let redirect_url = url::Url::parse(&self.redirect_url())
            .map_err(|e| PipelineError::Config(format!("Invalid redirect URL: {}", e)))?;

        let bind_addr = self.bind_addr()?;

        let cookie_ttl = self.cookie_ttl()?;
        let capture_ttl = bounded_ttl("OIDC capture TTL", self.capture_ttl)?;

        for (name, path) in [
            ("login", &self.login_path),
            ("logout", &self.logout_path),
            ("access denied", &self.access_denied_path),
            ("API prefix", &self.api_prefix),
        ] {
            if !path.starts_with('/') {
                return Err(PipelineError::Config(format!(
                    "The {} path must start with '/': {}",
                    name, path
                )));
            }
        }

        for allowed in &self.allowed_return_urls {
            url::Url::parse(allowed).map_err(|e| {
                PipelineError::Config(format!("Invalid allowed return URL '{}': {}", allowed, e))
            })?;
        }

        let provider = ProviderSettings {
            name: self.login_provider.clone(),
            issuer_url: self.oidc_issuer_url.clone(),
            client_id: self.oidc_client_id.clone(),
            client_secret: self.oidc_client_secret.clone(),
            scopes: self.scopes(),
            redirect_url: redirect_url.to_string(),
        };

        let mut settings = Settings::new(self.application_name.clone(), provider);
        settings.bind_addr = bind_addr;
        settings.cookie_ttl = cookie_ttl;
        settings.capture_ttl = capture_ttl;
        settings.idp_timeout = Duration::from_secs(self.idp_timeout);
        settings.paths.login = self.login_path.clone();
        settings.paths.logout = self.logout_path.clone();
        settings.paths.access_denied = self.access_denied_path.clone();
        settings.api_prefix = self.api_prefix.trim_end_matches('/').to_string();
        settings.allowed_return_urls = self.allowed_return_urls.clone();

        Ok(settings)
    }

    /// Parse the shared cookie idle timeout
    fn cookie_ttl(&self) -> Result<Duration> {
        let secs: u64 = self.cookie_ttl.trim().parse().map_err(|e| {
            PipelineError::Config(format!(
                "Invalid cookie TTL '{}': {}",
                self.cookie_ttl, e
            ))
        })?;
        bounded_ttl("Cookie TTL", secs)
    }

    /// Address to listen on; usable even when the rest of the configuration is not
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| PipelineError::Config(format!("Invalid bind address '{}': {}", self.bind, e)))
    }

    /// Get OAuth scopes as a list (with defaults)
    pub fn scopes(&self) -> Vec<String> {
        let scopes_str = self.oidc_scopes.as_deref().unwrap_or(DEFAULT_SCOPES);

        let mut scopes: Vec<String> = scopes_str.split_whitespace().map(String::from).collect();

        // Ensure "openid" scope is always included
        if !scopes.iter().any(|s| s == "openid") {
            scopes.insert(0, "openid".to_string());
        }

        scopes
    }

    /// Get redirect URL (with default)
    pub fn redirect_url(&self) -> String {
        self.oidc_redirect_url
            .clone()
            .unwrap_or_else(|| DEFAULT_REDIRECT_URL.to_string())
    }

    /// Get log level based on flags
    pub fn log_level(&self) -> tracing::Level {
        if self.silent {
            tracing::Level::ERROR
        } else if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

/// A TTL in seconds, between one second and the cache's [`MAX_TTL`]
fn bounded_ttl(name: &str, secs: u64) -> Result<Duration> {
    let ttl = Duration::from_secs(secs);
    if secs == 0 {
        return Err(PipelineError::Config(format!(
            "{} must be greater than zero",
            name
        )));
    }
    if ttl > MAX_TTL {
        return Err(PipelineError::Config(format!(
            "{} must not exceed {} seconds",
            name,
            MAX_TTL.as_secs()
        )));
    }
    Ok(ttl)
}
