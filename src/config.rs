//! Configuration for the calbridge server

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::provider::google::GOOGLE_CALENDAR_API_BASE;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,

    /// Where the consent screen sends the user back to
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Public push-notification endpoint; channels are only registered for https
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Shared secret echoed back by the provider on every notification
    #[serde(default)]
    pub webhook_token: Option<String>,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,

    /// Timeout applied to every provider request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between scheduled sync ticks (0 disables the scheduler)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
    #[serde(default = "default_managed_calendar_name")]
    pub managed_calendar_name: String,
    #[serde(default = "default_managed_calendar_description")]
    pub managed_calendar_description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Secret the credential-encryption key is derived from
    #[serde(default)]
    pub token_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// User the token authenticates as
    pub user_id: i64,
    /// The hashed API token (argon2 hash)
    pub token_hash: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3040
}

fn default_db_path() -> PathBuf {
    PathBuf::from("calbridge.sqlite")
}

fn default_redirect_uri() -> String {
    "http://localhost:3040/oauth/google/callback".to_string()
}

fn default_api_base_url() -> String {
    GOOGLE_CALENDAR_API_BASE.to_string()
}

fn default_oauth_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_userinfo_url() -> String {
    "https://openidconnect.googleapis.com/v1/userinfo".to_string()
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_interval_secs() -> u64 {
    900
}

fn default_lookback_days() -> i64 {
    7
}

fn default_lookahead_days() -> i64 {
    30
}

fn default_managed_calendar_name() -> String {
    "Calbridge Todos".to_string()
}

fn default_managed_calendar_description() -> String {
    "Todos and deadlines managed by calbridge".to_string()
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_redirect_uri(),
            webhook_url: None,
            webhook_token: None,
            api_base_url: default_api_base_url(),
            oauth_token_url: default_oauth_token_url(),
            userinfo_url: default_userinfo_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lookback_days: default_lookback_days(),
            lookahead_days: default_lookahead_days(),
            managed_calendar_name: default_managed_calendar_name(),
            managed_calendar_description: default_managed_calendar_description(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: default_bind(),
                port: default_port(),
            },
            database: DatabaseConfig {
                path: default_db_path(),
            },
            google: GoogleConfig::default(),
            sync: SyncConfig::default(),
            security: SecurityConfig::default(),
            tokens: Vec::new(),
        }
    }
}

impl GoogleConfig {
    /// The webhook URL, only when the provider will accept it
    pub fn https_webhook_url(&self) -> Option<&str> {
        let raw = self.webhook_url.as_deref()?;
        match Url::parse(raw) {
            Ok(url) if url.scheme() == "https" => Some(raw),
            _ => None,
        }
    }
}

impl Config {
    /// `CALBRIDGE_CONFIG`, then the first existing well-known file, then the
    /// per-user config dir (which may not exist yet)
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(explicit) = std::env::var("CALBRIDGE_CONFIG") {
            return Ok(PathBuf::from(explicit));
        }

        // /data is the container volume
        let found = ["config.toml", "/data/config.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists());
        if let Some(found) = found {
            return Ok(found);
        }

        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("calbridge")
            .join("config.toml"))
    }

    /// Config from [`Config::default_path`], falling back to defaults, with
    /// environment overrides applied
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        let mut cfg = match path.exists() {
            true => Self::load_from(&path)?,
            false => Self::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Secrets may come from the environment instead of the file
    pub fn apply_env_overrides(&mut self) {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        if let Some(id) = env("GOOGLE_CLIENT_ID") {
            self.google.client_id = id;
        }
        if let Some(secret) = env("GOOGLE_CLIENT_SECRET") {
            self.google.client_secret = secret;
        }
        if let Some(secret) = env("CALBRIDGE_TOKEN_SECRET") {
            self.security.token_secret = secret;
        }
    }

    /// Write the config with a short header, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let body = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let document = format!(
            "# calbridge configuration\n\
             # google.webhook_url must be https for push channels to be registered\n\
             # API tokens: calbridge token --name <label> --user <user-id>\n\n\
             {body}"
        );
        std::fs::write(path, document)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// User id the API token belongs to, if it matches any configured token
    pub fn validate_token(&self, token: &str) -> Option<i64> {
        let argon2 = Argon2::default();
        self.tokens.iter().find_map(|entry| {
            let hash = PasswordHash::new(&entry.token_hash).ok()?;
            argon2.verify_password(token.as_bytes(), &hash).ok()?;
            Some(entry.user_id)
        })
    }

    pub fn token_named(&self, name: &str) -> Option<&TokenConfig> {
        self.tokens.iter().find(|entry| entry.name == name)
    }
}

/// Argon2 PHC string for an API token
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow::anyhow!("Failed to hash token: {err}"))
}
