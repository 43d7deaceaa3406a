use crate::credentials::{validate_key, CipherError, KEY_SIZE};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "BROKERLINK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid encryption key: {0}")]
    InvalidKey(#[source] CipherError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Complete brokerlink configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub kite: KiteConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Where OAuth states live between initiation and callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    /// Shared SQLite table, survives restarts
    #[default]
    Sqlite,
    /// Process-local map, single instance only
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub state_backend: StateBackend,
}

fn default_db_path() -> String {
    "brokerlink.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            state_backend: StateBackend::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct KiteConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_kite_login_url")]
    pub login_url: String,
    #[serde(default = "default_kite_api_url")]
    pub api_url: String,
}

fn default_kite_login_url() -> String {
    crate::broker::kite::DEFAULT_LOGIN_URL.to_string()
}

fn default_kite_api_url() -> String {
    crate::broker::kite::DEFAULT_API_URL.to_string()
}

impl Default for KiteConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            login_url: default_kite_login_url(),
            api_url: default_kite_api_url(),
        }
    }
}

impl fmt::Debug for KiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KiteConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &redacted(&self.api_secret))
            .field("login_url", &self.login_url)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Authorization flow settings.
///
/// Redirect targets may contain `{broker}`, replaced with the broker name.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Only disable for plain-HTTP local development
    #[serde(default = "default_cookie_secure")]
    pub cookie_secure: bool,
    #[serde(default = "default_success_redirect")]
    pub success_redirect: String,
    /// The error code is appended verbatim
    #[serde(default = "default_error_redirect_base")]
    pub error_redirect_base: String,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_seconds: u64,
    #[serde(default = "default_store_timeout")]
    pub store_timeout_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_cookie_name() -> String {
    crate::oauth::DEFAULT_COOKIE_NAME.to_string()
}

fn default_cookie_secure() -> bool {
    true
}

fn default_success_redirect() -> String {
    "/?{broker}_connected=success".to_string()
}

fn default_error_redirect_base() -> String {
    "/?{broker}_error=".to_string()
}

fn default_exchange_timeout() -> u64 {
    10
}

fn default_store_timeout() -> u64 {
    5
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            cookie_name: default_cookie_name(),
            cookie_secure: default_cookie_secure(),
            success_redirect: default_success_redirect(),
            error_redirect_base: default_error_redirect_base(),
            exchange_timeout_seconds: default_exchange_timeout(),
            store_timeout_seconds: default_store_timeout(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Base64 of the 32-byte credential master key
    #[serde(default)]
    pub encryption_key: String,
    /// HMAC secret shared by session and state tokens
    #[serde(default)]
    pub signing_secret: String,
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("encryption_key", &redacted(&self.encryption_key))
            .field("signing_secret", &redacted(&self.signing_secret))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

/// Validated key material, built once at startup.
pub struct Secrets {
    pub encryption_key: [u8; KEY_SIZE],
    pub signing_secret: Vec<u8>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secrets { .. }")
    }
}

impl AppConfig {
    /// Loads the TOML file named by `BROKERLINK_CONFIG` (defaults when
    /// unset) and applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => load_config(&path)?,
            Err(_) => AppConfig::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overrides file values with any variable `lookup` returns.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets: [(&str, &mut String); 6] = [
            ("KITE_API_KEY", &mut self.kite.api_key),
            ("KITE_API_SECRET", &mut self.kite.api_secret),
            ("BROKERLINK_ENCRYPTION_KEY", &mut self.security.encryption_key),
            ("BROKERLINK_SIGNING_SECRET", &mut self.security.signing_secret),
            ("BROKERLINK_DB_PATH", &mut self.database.path),
            ("BROKERLINK_BIND_ADDR", &mut self.server.bind_addr),
        ];

        for (name, target) in targets {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                *target = value;
            }
        }
    }

    /// Checks everything the service needs to start, except key material
    /// (see [`AppConfig::secrets`]).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kite.api_key.is_empty() {
            return Err(ConfigError::Missing("KITE_API_KEY"));
        }
        if self.kite.api_secret.is_empty() {
            return Err(ConfigError::Missing("KITE_API_SECRET"));
        }
        if self.oauth.state_ttl_seconds <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "oauth.state_ttl_seconds",
                message: "must be positive".into(),
            });
        }
        if self.oauth.exchange_timeout_seconds == 0 || self.oauth.store_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "oauth timeouts",
                message: "must be at least one second".into(),
            });
        }
        if self.oauth.cleanup_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "oauth.cleanup_interval_seconds",
                message: "must be at least one second".into(),
            });
        }
        Ok(())
    }

    /// Decodes and validates the encryption key and signing secret.
    pub fn secrets(&self) -> Result<Secrets, ConfigError> {
        if self.security.encryption_key.is_empty() {
            return Err(ConfigError::Missing("BROKERLINK_ENCRYPTION_KEY"));
        }
        if self.security.signing_secret.is_empty() {
            return Err(ConfigError::Missing("BROKERLINK_SIGNING_SECRET"));
        }

        let encryption_key =
            validate_key(&self.security.encryption_key).map_err(ConfigError::InvalidKey)?;

        Ok(Secrets {
            encryption_key,
            signing_secret: self.security.signing_secret.as_bytes().to_vec(),
        })
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}
