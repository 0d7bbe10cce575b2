//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub actor: ActorConfig,
    pub auth: AuthConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "notes.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://notes.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// The single local actor
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub summary: String,
    pub icon_url: Option<String>,
    /// PKCS#8 PEM file holding the signing key. Generated when missing.
    pub private_key_path: PathBuf,
}

/// Owner API authentication
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer token accepted on the owner API
    pub owner_token: String,
}

/// Outbound/inbound federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Timeout applied to every outbound HTTP request
    pub request_timeout_secs: u64,
    /// Accepted clock skew for the signed Date header
    pub signature_max_skew_secs: i64,
    /// Allow fetching from and delivering to loopback/private hosts
    #[serde(default)]
    pub allow_private_networks: bool,
    pub user_agent: String,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Delivery job scheduling
///
/// Defaults: 5 attempts, 1 minute base backoff doubling per attempt,
/// capped at 1 hour.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub poll_interval_secs: u64,
    /// Upper bound on concurrently running deliveries
    pub max_concurrent: usize,
    /// Maximum jobs claimed per scheduler tick
    pub batch_size: u32,
    /// In-flight jobs claimed longer ago than this are returned to pending
    pub stale_claim_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_secs: 60,
            max_backoff_secs: 3600,
            poll_interval_secs: 5,
            max_concurrent: 8,
            batch_size: 50,
            stale_claim_secs: 600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDINOTE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let delivery = DeliveryConfig::default();
        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedinote.db")?
            .set_default("actor.private_key_path", "data/private.pem")?
            .set_default("actor.summary", "")?
            .set_default("federation.request_timeout_secs", 10)?
            .set_default("federation.signature_max_skew_secs", 300)?
            .set_default("federation.allow_private_networks", false)?
            .set_default(
                "federation.user_agent",
                format!("fedinote/{}", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("delivery.max_attempts", delivery.max_attempts)?
            .set_default("delivery.base_backoff_secs", delivery.base_backoff_secs)?
            .set_default("delivery.max_backoff_secs", delivery.max_backoff_secs)?
            .set_default("delivery.poll_interval_secs", delivery.poll_interval_secs)?
            .set_default("delivery.max_concurrent", delivery.max_concurrent as u64)?
            .set_default("delivery.batch_size", delivery.batch_size)?
            .set_default("delivery.stale_claim_secs", delivery.stale_claim_secs)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDINOTE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// URL of the local actor document, e.g. `https://notes.example.com/u/alice`
    pub fn actor_url(&self) -> String {
        format!("{}/u/{}", self.server.base_url(), self.actor.username)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        const MIN_OWNER_TOKEN_BYTES: usize = 16;

        if self.auth.owner_token.len() < MIN_OWNER_TOKEN_BYTES {
            return Err(AppError::Config(format!(
                "auth.owner_token must be at least {} bytes",
                MIN_OWNER_TOKEN_BYTES
            )));
        }

        if self.actor.username.trim().is_empty() {
            return Err(AppError::Config(
                "actor.username must not be empty".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.delivery.base_backoff_secs > self.delivery.max_backoff_secs {
            return Err(AppError::Config(
                "delivery.base_backoff_secs must not exceed delivery.max_backoff_secs".to_string(),
            ));
        }

        if self.delivery.max_concurrent == 0 {
            return Err(AppError::Config(
                "delivery.max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.delivery.stale_claim_secs <= self.federation.request_timeout_secs {
            return Err(AppError::Config(
                "delivery.stale_claim_secs must exceed federation.request_timeout_secs".to_string(),
            ));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
        {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
