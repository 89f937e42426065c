use crate::error::{CoreError, Result};
use const_format::concatcp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Environment variable overriding `[streaming].client_id`.
pub const CLIENT_ID_ENV: &str = "SONOSENSE_CLIENT_ID";
/// Environment variable overriding `[streaming].client_secret`.
pub const CLIENT_SECRET_ENV: &str = "SONOSENSE_CLIENT_SECRET";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SonosenseConfig {
    /// Store configuration (SQLite database)
    #[serde(default)]
    pub store: StoreConfig,
    /// Secret store configuration
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// Streaming service credentials
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Engine timing and retention knobs
    #[serde(default)]
    pub engine: EngineConfig,
    /// Motion event ingress
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    crate::paths::store_db_path()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Directory holding per-user token bundles
    #[serde(default = "default_secrets_dir")]
    pub dir: PathBuf,
    /// TTL of the in-memory secret cache in seconds
    #[serde(default = "default_secret_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Maximum number of cached secret entries
    #[serde(default = "default_secret_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_secrets_dir() -> PathBuf {
    crate::paths::secrets_dir()
}

const DEFAULT_SECRET_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_SECRET_CACHE_CAPACITY: usize = 256;

const fn default_secret_cache_ttl_secs() -> u64 {
    DEFAULT_SECRET_CACHE_TTL_SECS
}

const fn default_secret_cache_capacity() -> usize {
    DEFAULT_SECRET_CACHE_CAPACITY
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            dir: default_secrets_dir(),
            cache_ttl_secs: DEFAULT_SECRET_CACHE_TTL_SECS,
            cache_capacity: DEFAULT_SECRET_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Spotify application client id
    #[serde(default)]
    pub client_id: String,
    /// Spotify application client secret
    #[serde(default)]
    pub client_secret: String,
}

impl StreamingConfig {
    /// Validate that both credentials are present.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigMissingField`] naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "streaming.client_id".into(),
            });
        }
        if self.client_secret.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "streaming.client_secret".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inactivity timeout applied when a sensor does not set its own
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u32,
    /// Debounce window applied when a sensor does not set its own
    #[serde(default = "default_debounce_minutes")]
    pub default_debounce_minutes: u32,
    /// Days before completed sessions and events expire
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u32,
    /// Refresh tokens this many minutes before expiry
    #[serde(default = "default_token_refresh_buffer_minutes")]
    pub token_refresh_buffer_minutes: u32,
    /// Seconds between timeout sweeper passes
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Seconds between token refresher passes
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Hard timeout on each outbound store/HTTP call in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// End-to-end budget per dispatched motion event in seconds
    #[serde(default = "default_dispatch_budget_secs")]
    pub dispatch_budget_secs: u64,
}

const DEFAULT_TIMEOUT_MINUTES: u32 = 5;
const DEFAULT_DEBOUNCE_MINUTES: u32 = 2;
const DEFAULT_SESSION_TTL_DAYS: u32 = 30;
const DEFAULT_TOKEN_REFRESH_BUFFER_MINUTES: u32 = 5;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DISPATCH_BUDGET_SECS: u64 = 15;

const fn default_timeout_minutes() -> u32 {
    DEFAULT_TIMEOUT_MINUTES
}

const fn default_debounce_minutes() -> u32 {
    DEFAULT_DEBOUNCE_MINUTES
}

const fn default_session_ttl_days() -> u32 {
    DEFAULT_SESSION_TTL_DAYS
}

const fn default_token_refresh_buffer_minutes() -> u32 {
    DEFAULT_TOKEN_REFRESH_BUFFER_MINUTES
}

const fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

const fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

const fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

const fn default_dispatch_budget_secs() -> u64 {
    DEFAULT_DISPATCH_BUDGET_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            default_debounce_minutes: DEFAULT_DEBOUNCE_MINUTES,
            session_ttl_days: DEFAULT_SESSION_TTL_DAYS,
            token_refresh_buffer_minutes: DEFAULT_TOKEN_REFRESH_BUFFER_MINUTES,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            dispatch_budget_secs: DEFAULT_DISPATCH_BUDGET_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Address the motion ingress listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_owned()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable file logging to the config directory
    #[serde(default)]
    pub enabled: bool,
}

impl SonosenseConfig {
    /// Get the configuration directory path (~/.config/sonosense/)
    #[must_use]
    pub fn config_dir() -> PathBuf {
        crate::paths::config_dir()
    }

    /// Get the config file path (~/.config/sonosense/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from file or create a template on first run.
    ///
    /// Streaming credentials may be supplied through the environment
    /// (`SONOSENSE_CLIENT_ID` / `SONOSENSE_CLIENT_SECRET`), which takes
    /// precedence over the file so secrets can stay out of it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigNotFound`] after writing the template on
    /// first run, or a parse/IO error if the file cannot be read.
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&config_path, CONFIG_TEMPLATE)?;
            return Err(CoreError::ConfigNotFound { path: config_path });
        }

        let content = fs::read_to_string(&config_path)?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config from a TOML string (used by tests and tooling).
    ///
    /// # Errors
    ///
    /// Returns a parse error when the TOML is malformed.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(client_id) = std::env::var(CLIENT_ID_ENV) {
            if !client_id.is_empty() {
                self.streaming.client_id = client_id;
            }
        }
        if let Ok(client_secret) = std::env::var(CLIENT_SECRET_ENV) {
            if !client_secret.is_empty() {
                self.streaming.client_secret = client_secret;
            }
        }
    }
}

/// Config template written on first run.
pub const CONFIG_TEMPLATE: &str = concatcp!(
    "# sonosense configuration\n",
    "# ~/.config/sonosense/config.toml\n",
    "\n",
    "[store]\n",
    "# SQLite database holding sensors, users, sessions and motion events.\n",
    "# db_path = \"~/.config/sonosense/sonosense.db\"\n",
    "\n",
    "[secrets]\n",
    "# Directory holding per-user Spotify token bundles (one JSON file per user).\n",
    "# dir = \"~/.config/sonosense/secrets\"\n",
    "cache_ttl_secs = ",
    DEFAULT_SECRET_CACHE_TTL_SECS,
    "\n",
    "cache_capacity = ",
    DEFAULT_SECRET_CACHE_CAPACITY,
    "\n",
    "\n",
    "[streaming]\n",
    "# Spotify application credentials from https://developer.spotify.com/dashboard\n",
    "# May also be provided via SONOSENSE_CLIENT_ID / SONOSENSE_CLIENT_SECRET.\n",
    "client_id = \"\"\n",
    "client_secret = \"\"\n",
    "\n",
    "[engine]\n",
    "default_timeout_minutes = ",
    DEFAULT_TIMEOUT_MINUTES,
    "\n",
    "default_debounce_minutes = ",
    DEFAULT_DEBOUNCE_MINUTES,
    "\n",
    "session_ttl_days = ",
    DEFAULT_SESSION_TTL_DAYS,
    "\n",
    "token_refresh_buffer_minutes = ",
    DEFAULT_TOKEN_REFRESH_BUFFER_MINUTES,
    "\n",
    "sweep_interval_secs = ",
    DEFAULT_SWEEP_INTERVAL_SECS,
    "\n",
    "refresh_interval_secs = ",
    DEFAULT_REFRESH_INTERVAL_SECS,
    "\n",
    "\n",
    "[ingest]\n",
    "bind_addr = \"",
    DEFAULT_BIND_ADDR,
    "\"\n",
    "\n",
    "[logging]\n",
    "# Enable file logging to the config directory (sonosense.log)\n",
    "enabled = false\n",
);
