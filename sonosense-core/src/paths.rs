//! Path constants for configuration and data files.

use std::path::PathBuf;

/// The name of the configuration directory under ~/.config/
pub const CONFIG_DIR_NAME: &str = "sonosense";

/// The name of the main configuration file
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// The name of the engine database file
pub const STORE_DB_FILE_NAME: &str = "sonosense.db";

/// The name of the per-user secret bundle directory
pub const SECRETS_DIR_NAME: &str = "secrets";

/// The name of the log file when file logging is enabled
pub const LOG_FILE_NAME: &str = "sonosense.log";

/// Get the configuration directory path (~/.config/sonosense/)
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(CONFIG_DIR_NAME)
}

/// Get the config file path (~/.config/sonosense/config.toml)
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

/// Get the engine database path (`~/.config/sonosense/sonosense.db`)
#[must_use]
pub fn store_db_path() -> PathBuf {
    config_dir().join(STORE_DB_FILE_NAME)
}

/// Get the secret bundle directory (`~/.config/sonosense/secrets/`)
#[must_use]
pub fn secrets_dir() -> PathBuf {
    config_dir().join(SECRETS_DIR_NAME)
}

/// Get the log file path (`~/.config/sonosense/sonosense.log`)
#[must_use]
pub fn log_file_path() -> PathBuf {
    config_dir().join(LOG_FILE_NAME)
}
