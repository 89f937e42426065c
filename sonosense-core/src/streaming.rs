//! Streaming-service abstraction consumed by the engine.
//!
//! The engine never sees raw HTTP: every place a rate limit or credential
//! expiry can be observed goes through this trait. Implementations take a
//! bearer access token per call and cache nothing.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A playback target known to the streaming service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

/// Current playback state; `None` at the trait level means no active playback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub track_uri: Option<String>,
    #[serde(default)]
    pub context_uri: Option<String>,
}

impl PlaybackState {
    /// A paused player that still has something loaded; starting playback
    /// against it resumes rather than starts fresh.
    #[must_use]
    pub const fn is_paused_with_context(&self) -> bool {
        !self.is_playing && (self.track_uri.is_some() || self.context_uri.is_some())
    }
}

/// Parameters for a start-playback call.
#[derive(Debug, Clone, Default)]
pub struct StartPlayback {
    pub device_id: Option<String>,
    pub context_uri: Option<String>,
    pub shuffle: Option<bool>,
    pub volume_percent: Option<u8>,
}

/// Result of an OAuth refresh-token exchange.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in_secs: i64,
    pub scope: Option<String>,
}

/// Typed client over the streaming API.
///
/// All methods may fail with the streaming variants of
/// [`CoreError`](crate::CoreError): `SpotifyAuthFailed` (never retried),
/// `SpotifyRateLimited`, `SpotifyUpstream` and `NetworkError`.
#[async_trait]
pub trait StreamingApi: Send + Sync {
    /// Fetch the current playback state; `Ok(None)` when nothing is playing
    /// on any device.
    async fn playback_state(&self, access_token: &str) -> Result<Option<PlaybackState>>;

    /// Start or resume playback. Shuffle and volume are best-effort
    /// follow-ups; their failure does not fail the start.
    async fn start_playback(&self, access_token: &str, request: &StartPlayback) -> Result<()>;

    /// Pause playback, optionally on a specific device.
    async fn pause_playback(&self, access_token: &str, device_id: Option<&str>) -> Result<()>;

    /// List the devices available to the account.
    async fn list_devices(&self, access_token: &str) -> Result<Vec<Device>>;

    /// Exchange a refresh token for a fresh access token.
    async fn refresh_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<RefreshedToken>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_with_context() {
        let state = PlaybackState {
            is_playing: false,
            device: None,
            track_uri: Some("spotify:track:abc".into()),
            context_uri: None,
        };
        assert!(state.is_paused_with_context());

        let playing = PlaybackState {
            is_playing: true,
            ..state.clone()
        };
        assert!(!playing.is_paused_with_context());

        let empty = PlaybackState::default();
        assert!(!empty.is_paused_with_context());
    }
}
