//! Typed client over the Spotify Web API.
//!
//! Every method takes a bearer access token; the client caches nothing.
//! Retry policy: transport failures and 5xx responses are retried up to
//! three attempts with exponential backoff (base 500 ms, cap 5 s); a 429
//! gets one respectful retry honouring `Retry-After`; a 401 is never
//! retried.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use sonosense_core::error::{CoreError, Result};
use sonosense_core::streaming::{
    Device, PlaybackState, RefreshedToken, StartPlayback, StreamingApi,
};
use std::time::Duration;
use tracing::{debug, warn};

const API_BASE_URL: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 5_000;

/// Default timeout for HTTP requests (10 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Exponential backoff delay for the given 1-based attempt number.
fn backoff_delay(attempt: u32) -> Duration {
    let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(multiplier).min(BACKOFF_CAP_MS))
}

/// Seconds to wait from a `Retry-After` header, defaulting to one second.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(1)
}

#[derive(Debug, Deserialize)]
struct ApiDevice {
    id: Option<String>,
    name: String,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    volume_percent: Option<u8>,
}

impl From<ApiDevice> for Device {
    fn from(device: ApiDevice) -> Self {
        Self {
            id: device.id,
            name: device.name,
            is_active: device.is_active,
            volume_percent: device.volume_percent,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct ApiContext {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct PlayerResponse {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    device: Option<ApiDevice>,
    #[serde(default)]
    item: Option<ApiItem>,
    #[serde(default)]
    context: Option<ApiContext>,
}

impl From<PlayerResponse> for PlaybackState {
    fn from(response: PlayerResponse) -> Self {
        Self {
            is_playing: response.is_playing,
            device: response.device.map(Device::from),
            track_uri: response.item.map(|item| item.uri),
            context_uri: response.context.map(|context| context.uri),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    devices: Vec<ApiDevice>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

/// Spotify Web API client implementing [`StreamingApi`].
pub struct SpotifyApiClient {
    http: reqwest::Client,
}

impl SpotifyApiClient {
    /// Create a client with the default 10-second call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client with an explicit per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent("sonosense/0.1 (https://github.com/sonosense/sonosense)")
            .build()?;
        Ok(Self { http })
    }

    /// Send a request with the adapter's retry policy applied.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder + Send + Sync,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        let mut rate_limit_retried = false;

        loop {
            attempt += 1;
            match build().send().await {
                Ok(response) => {
                    let status = response.status();

                    if status == StatusCode::UNAUTHORIZED {
                        return Err(CoreError::SpotifyAuthFailed {
                            reason: "access token rejected (401)".into(),
                        });
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after_secs = parse_retry_after(response.headers());
                        if rate_limit_retried {
                            return Err(CoreError::SpotifyRateLimited { retry_after_secs });
                        }
                        rate_limit_retried = true;
                        warn!(
                            "Spotify rate limited, honouring Retry-After of {}s",
                            retry_after_secs
                        );
                        tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                        continue;
                    }

                    if status.is_server_error() {
                        if attempt >= MAX_ATTEMPTS {
                            return Err(CoreError::SpotifyUpstream {
                                status: status.as_u16(),
                            });
                        }
                        let delay = backoff_delay(attempt);
                        warn!(
                            "Spotify returned {}, retrying in {:?} (attempt {}/{})",
                            status, delay, attempt, MAX_ATTEMPTS
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if !status.is_success() {
                        return Err(CoreError::SpotifyUpstream {
                            status: status.as_u16(),
                        });
                    }

                    return Ok(response);
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(e.into());
                    }
                    let delay = backoff_delay(attempt);
                    warn!(
                        "Spotify request failed ({}), retrying in {:?} (attempt {}/{})",
                        e, delay, attempt, MAX_ATTEMPTS
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Best-effort follow-up to a successful start; never fails the start.
    async fn apply_playback_settings(&self, access_token: &str, request: &StartPlayback) {
        if let Some(shuffle) = request.shuffle {
            let url = format!("{API_BASE_URL}/me/player/shuffle");
            let result = self
                .send_with_retry(|| {
                    let mut builder = self
                        .http
                        .put(&url)
                        .bearer_auth(access_token)
                        .query(&[("state", shuffle)]);
                    if let Some(ref device_id) = request.device_id {
                        builder = builder.query(&[("device_id", device_id)]);
                    }
                    builder.header(reqwest::header::CONTENT_LENGTH, 0)
                })
                .await;
            if let Err(e) = result {
                warn!("Failed to apply shuffle setting: {}", e);
            }
        }

        if let Some(volume) = request.volume_percent {
            let url = format!("{API_BASE_URL}/me/player/volume");
            let result = self
                .send_with_retry(|| {
                    let mut builder = self
                        .http
                        .put(&url)
                        .bearer_auth(access_token)
                        .query(&[("volume_percent", u32::from(volume))]);
                    if let Some(ref device_id) = request.device_id {
                        builder = builder.query(&[("device_id", device_id)]);
                    }
                    builder.header(reqwest::header::CONTENT_LENGTH, 0)
                })
                .await;
            if let Err(e) = result {
                warn!("Failed to apply volume setting: {}", e);
            }
        }
    }
}

#[async_trait]
impl StreamingApi for SpotifyApiClient {
    async fn playback_state(&self, access_token: &str) -> Result<Option<PlaybackState>> {
        let url = format!("{API_BASE_URL}/me/player");
        let response = self
            .send_with_retry(|| self.http.get(&url).bearer_auth(access_token))
            .await?;

        // 204 means no active playback on any device.
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let player: PlayerResponse = response.json().await?;
        Ok(Some(player.into()))
    }

    async fn start_playback(&self, access_token: &str, request: &StartPlayback) -> Result<()> {
        let url = format!("{API_BASE_URL}/me/player/play");

        let mut body = serde_json::Map::new();
        if let Some(ref context_uri) = request.context_uri {
            body.insert("context_uri".into(), context_uri.clone().into());
        }
        let body = serde_json::Value::Object(body);

        debug!(
            "Starting playback (device: {:?}, context: {:?})",
            request.device_id, request.context_uri
        );

        self.send_with_retry(|| {
            let mut builder = self.http.put(&url).bearer_auth(access_token).json(&body);
            if let Some(ref device_id) = request.device_id {
                builder = builder.query(&[("device_id", device_id)]);
            }
            builder
        })
        .await?;

        self.apply_playback_settings(access_token, request).await;
        Ok(())
    }

    async fn pause_playback(&self, access_token: &str, device_id: Option<&str>) -> Result<()> {
        let url = format!("{API_BASE_URL}/me/player/pause");
        debug!("Pausing playback (device: {:?})", device_id);

        self.send_with_retry(|| {
            let mut builder = self
                .http
                .put(&url)
                .bearer_auth(access_token)
                .header(reqwest::header::CONTENT_LENGTH, 0);
            if let Some(device_id) = device_id {
                builder = builder.query(&[("device_id", device_id)]);
            }
            builder
        })
        .await?;
        Ok(())
    }

    async fn list_devices(&self, access_token: &str) -> Result<Vec<Device>> {
        let url = format!("{API_BASE_URL}/me/player/devices");
        let response = self
            .send_with_retry(|| self.http.get(&url).bearer_auth(access_token))
            .await?;

        let devices: DevicesResponse = response.json().await?;
        Ok(devices.devices.into_iter().map(Device::from).collect())
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<RefreshedToken> {
        let response = self
            .send_with_retry(|| {
                self.http
                    .post(TOKEN_URL)
                    .basic_auth(client_id, Some(client_secret))
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                    ])
            })
            .await?;

        let token: TokenResponse = response.json().await?;
        Ok(RefreshedToken {
            access_token: token.access_token,
            expires_in_secs: token.expires_in,
            scope: token.scope,
        })
    }
}
