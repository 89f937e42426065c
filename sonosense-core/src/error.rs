use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Config file not found at {path}. A template has been created - please edit it with your Spotify credentials and restart.")]
    ConfigNotFound { path: PathBuf },

    #[error("Missing required config field: {field}")]
    ConfigMissingField { field: String },

    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    // Validation / lookup errors
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{resource} not found: {id}")]
    ResourceNotFound { resource: &'static str, id: String },

    // Engine errors
    #[error("Could not open session for sensor {sensor_id}: persistent write conflict")]
    Busy { sensor_id: String },

    #[error("User {user_id} has no usable Spotify credentials")]
    NoSpotifyCredentials { user_id: String },

    #[error("Sensor {sensor_id} has no Spotify device configured")]
    NoDeviceConfigured { sensor_id: String },

    #[error("Secret entry not found: {secret_ref}")]
    SecretNotFound { secret_ref: String },

    // Streaming errors
    #[error("Spotify authentication failed: {reason}")]
    SpotifyAuthFailed { reason: String },

    #[error("Spotify API rate limited, retry after {retry_after_secs}s")]
    SpotifyRateLimited { retry_after_secs: u64 },

    #[error("Spotify API returned status {status}")]
    SpotifyUpstream { status: u16 },

    // Store errors
    #[error("Store database error: {0}")]
    StoreError(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    // Network errors
    #[error("Network request failed: {0}")]
    NetworkError(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
