//! API configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `MERCATO_DATABASE_URL` - `PostgreSQL` connection string (`memory://` for the in-process store)
//! - `GATEWAY_CLIENT_ID` - Payment gateway REST client ID
//! - `GATEWAY_CLIENT_SECRET` - Payment gateway REST client secret
//!
//! ## Optional
//! - `MERCATO_HOST` - Bind address (default: 127.0.0.1)
//! - `MERCATO_PORT` - Listen port (default: 4000)
//! - `MERCATO_ALLOWED_ORIGINS` - Comma-separated CORS origins (default: none)
//! - `MERCATO_STOREFRONT_URL` - Storefront base URL for gateway return links
//!   (default: <http://localhost:3000>)
//! - `MERCATO_BASE_CURRENCY` - ISO 4217 code for every order (default: USD)
//! - `MERCATO_LEGACY_ADMIN_TOKEN` - Deprecated static admin secret
//! - `MERCATO_LOG_FORMAT` - `text` or `json` (default: text)
//! - `GATEWAY_MODE` - `sandbox` or `live` (default: sandbox)
//! - `GATEWAY_TIMEOUT_SECS` - Upper bound for every gateway call (default: 15)
//! - `GATEWAY_WEBHOOK_SECRET` - HMAC secret for webhook signatures; webhooks
//!   are rejected when unset
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use mercato_core::CurrencyCode;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.0;
const MIN_LEGACY_TOKEN_LENGTH: usize = 32;

/// URL scheme that selects the in-process store instead of `PostgreSQL`.
pub const MEMORY_DATABASE_URL: &str = "memory://";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "xxx",
    "todo",
    "insert",
    "put-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Whether gateway calls go to the provider's sandbox or production API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayMode {
    #[default]
    Sandbox,
    Live,
}

impl GatewayMode {
    /// Default provider API base URL for this mode.
    #[must_use]
    pub const fn api_base(&self) -> &'static str {
        match self {
            Self::Sandbox => "https://api-m.sandbox.paypal.com",
            Self::Live => "https://api-m.paypal.com",
        }
    }
}

impl std::str::FromStr for GatewayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "live" | "production" => Ok(Self::Live),
            other => Err(format!("expected sandbox or live, got {other}")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// API application configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Origins allowed by CORS (storefront and admin front-ends)
    pub allowed_origins: Vec<String>,
    /// Storefront base URL, used for gateway return and cancel links
    pub storefront_url: Url,
    /// The single currency every order and gateway request is denominated in
    pub base_currency: CurrencyCode,
    /// Deprecated static admin secret (compatibility shim)
    pub legacy_admin_token: Option<SecretString>,
    /// Payment gateway configuration
    pub gateway: GatewayConfig,
    /// Log output format
    pub log_format: LogFormat,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Payment gateway configuration.
///
/// Implements `Debug` manually to redact secret fields.
#[derive(Clone)]
pub struct GatewayConfig {
    /// REST client ID
    pub client_id: String,
    /// REST client secret
    pub client_secret: SecretString,
    /// Sandbox or live
    pub mode: GatewayMode,
    /// API base URL (derived from `mode` unless overridden)
    pub api_base: Url,
    /// Upper bound for every gateway request
    pub timeout: Duration,
    /// Shared secret for webhook signatures
    pub webhook_secret: Option<SecretString>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("mode", &self.mode)
            .field("api_base", &self.api_base.as_str())
            .field("timeout", &self.timeout)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl ApiConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("MERCATO_DATABASE_URL")?;
        let host = parse_env("MERCATO_HOST", "127.0.0.1")?;
        let port = parse_env("MERCATO_PORT", "4000")?;
        let allowed_origins = parse_origins(&get_env_or_default("MERCATO_ALLOWED_ORIGINS", ""));
        let storefront_url = parse_url(
            "MERCATO_STOREFRONT_URL",
            &get_env_or_default("MERCATO_STOREFRONT_URL", "http://localhost:3000"),
        )?;
        let base_currency = parse_env("MERCATO_BASE_CURRENCY", "USD")?;

        let legacy_admin_token = get_optional_env("MERCATO_LEGACY_ADMIN_TOKEN")
            .map(|value| {
                validate_legacy_token(&value, "MERCATO_LEGACY_ADMIN_TOKEN")?;
                Ok::<_, ConfigError>(SecretString::from(value))
            })
            .transpose()?;

        let log_format = match get_env_or_default("MERCATO_LOG_FORMAT", "text").as_str() {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => {
                return Err(ConfigError::InvalidEnvVar(
                    "MERCATO_LOG_FORMAT".to_string(),
                    format!("expected text or json, got {other}"),
                ));
            }
        };

        Ok(Self {
            database_url,
            host,
            port,
            allowed_origins,
            storefront_url,
            base_currency,
            legacy_admin_token,
            gateway: GatewayConfig::from_env()?,
            log_format,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Whether the in-process store was requested instead of `PostgreSQL`.
    #[must_use]
    pub fn uses_memory_store(&self) -> bool {
        self.database_url.expose_secret() == MEMORY_DATABASE_URL
    }

    /// Where the gateway sends the customer after approving payment.
    #[must_use]
    pub fn payment_return_url(&self) -> String {
        join_url(&self.storefront_url, "checkout/success")
    }

    /// Where the gateway sends the customer after abandoning payment.
    #[must_use]
    pub fn payment_cancel_url(&self) -> String {
        join_url(&self.storefront_url, "checkout/cancel")
    }
}

impl GatewayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mode: GatewayMode = parse_env("GATEWAY_MODE", "sandbox")?;
        let api_base = parse_url(
            "GATEWAY_API_BASE",
            &get_env_or_default("GATEWAY_API_BASE", mode.api_base()),
        )?;
        let timeout_secs: u64 = parse_env("GATEWAY_TIMEOUT_SECS", "15")?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "GATEWAY_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            client_id: get_required_env("GATEWAY_CLIENT_ID")?,
            client_secret: get_validated_secret("GATEWAY_CLIENT_SECRET")?,
            mode,
            api_base,
            timeout: Duration::from_secs(timeout_secs),
            webhook_secret: get_optional_env("GATEWAY_WEBHOOK_SECRET")
                .map(|value| {
                    validate_secret_strength(&value, "GATEWAY_WEBHOOK_SECRET")?;
                    Ok::<_, ConfigError>(SecretString::from(value))
                })
                .transpose()?,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar(primary_key.to_string()))
}

/// Get an optional, non-empty environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable (or its default) with `FromStr`.
fn parse_env<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env_or_default(key, default)
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

fn parse_url(key: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// Split a comma-separated origin list, dropping blanks and trailing slashes.
fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().trim_end_matches('/'))
        .filter(|origin| !origin.is_empty())
        .map(String::from)
        .collect()
}

fn join_url(base: &Url, path: &str) -> String {
    format!("{}/{path}", base.as_str().trim_end_matches('/'))
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    if let Some(pattern) = PLACEHOLDER_PATTERNS.iter().find(|p| lower.contains(*p)) {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!("appears to be a placeholder (contains '{pattern}')"),
        ));
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

/// The legacy admin token grants full admin access, so it must also be long.
fn validate_legacy_token(token: &str, var_name: &str) -> Result<(), ConfigError> {
    if token.len() < MIN_LEGACY_TOKEN_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {MIN_LEGACY_TOKEN_LENGTH} characters (got {})",
                token.len()
            ),
        ));
    }
    validate_secret_strength(token, var_name)
}

/// Load and validate a secret from environment.
fn get_validated_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}
