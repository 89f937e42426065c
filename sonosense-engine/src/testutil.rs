//! Shared fixtures for engine tests: an in-memory store, a scripted
//! streaming mock, and seed helpers.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use chrono::Utc;
use sonosense_core::clock::{Clock, ManualClock};
use sonosense_core::db::Database;
use sonosense_core::error::{CoreError, Result};
use sonosense_core::events::EventStore;
use sonosense_core::model::{Sensor, SpotifyConfig, User};
use sonosense_core::secrets::{SecretStore, TokenBundle};
use sonosense_core::sensors::SensorStore;
use sonosense_core::streaming::{
    Device, PlaybackState, RefreshedToken, StartPlayback, StreamingApi,
};
use sonosense_core::users::UserStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatcher::MotionDispatcher;
use crate::registry::SessionRegistry;

/// Scripted [`StreamingApi`] implementation recording every call.
pub struct MockStreaming {
    state: Mutex<Option<PlaybackState>>,
    fail: bool,
    state_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    start_calls: Mutex<Vec<StartPlayback>>,
    pause_calls: Mutex<Vec<Option<String>>>,
}

impl MockStreaming {
    pub fn new(state: Option<PlaybackState>) -> Self {
        Self {
            state: Mutex::new(state),
            fail: false,
            state_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            start_calls: Mutex::new(Vec::new()),
            pause_calls: Mutex::new(Vec::new()),
        }
    }

    /// No active playback anywhere.
    pub fn idle() -> Self {
        Self::new(None)
    }

    /// Actively playing on the given device.
    pub fn playing(device_id: &str) -> Self {
        Self::new(Some(PlaybackState {
            is_playing: true,
            device: Some(Device {
                id: Some(device_id.into()),
                name: "Test speaker".into(),
                is_active: true,
                volume_percent: Some(60),
            }),
            track_uri: Some("spotify:track:abc".into()),
            context_uri: Some("spotify:playlist:P".into()),
        }))
    }

    /// Paused with a playlist still loaded.
    pub fn paused_with_context() -> Self {
        Self::new(Some(PlaybackState {
            is_playing: false,
            device: Some(Device {
                id: Some("d1".into()),
                name: "Test speaker".into(),
                is_active: false,
                volume_percent: Some(60),
            }),
            track_uri: None,
            context_uri: Some("spotify:playlist:P".into()),
        }))
    }

    /// Every call fails with an upstream 503.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(None)
        }
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail {
            return Err(CoreError::SpotifyUpstream { status: 503 });
        }
        Ok(())
    }

    pub fn state_calls(&self) -> usize {
        self.state_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> Vec<StartPlayback> {
        self.start_calls.lock().unwrap().clone()
    }

    pub fn pause_calls(&self) -> Vec<Option<String>> {
        self.pause_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamingApi for MockStreaming {
    async fn playback_state(&self, _access_token: &str) -> Result<Option<PlaybackState>> {
        self.check_fail()?;
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().clone())
    }

    async fn start_playback(&self, _access_token: &str, request: &StartPlayback) -> Result<()> {
        self.check_fail()?;
        self.start_calls.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn pause_playback(&self, _access_token: &str, device_id: Option<&str>) -> Result<()> {
        self.check_fail()?;
        self.pause_calls
            .lock()
            .unwrap()
            .push(device_id.map(str::to_owned));
        Ok(())
    }

    async fn list_devices(&self, _access_token: &str) -> Result<Vec<Device>> {
        self.check_fail()?;
        Ok(Vec::new())
    }

    async fn refresh_token(
        &self,
        _refresh_token: &str,
        _client_id: &str,
        _client_secret: &str,
    ) -> Result<RefreshedToken> {
        self.check_fail()?;
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RefreshedToken {
            access_token: "refreshed-access-token".into(),
            expires_in_secs: 3600,
            scope: Some("user-modify-playback-state".into()),
        })
    }
}

/// Fully wired engine over an in-memory database.
pub struct TestHarness {
    pub sensors: SensorStore,
    pub users: UserStore,
    pub events: EventStore,
    pub registry: Arc<SessionRegistry>,
    pub secrets: Arc<SecretStore>,
    pub streaming: Arc<MockStreaming>,
    pub clock: Arc<ManualClock>,
    pub dispatcher: MotionDispatcher,
    _secrets_dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new(streaming: MockStreaming) -> Self {
        let db = Database::open_in_memory().await.unwrap();
        let sensors = SensorStore::new(&db);
        let users = UserStore::new(&db);
        let events = EventStore::new(&db);
        let registry = Arc::new(SessionRegistry::new(&db, 30));

        let secrets_dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(
            SecretStore::new(
                secrets_dir.path().to_path_buf(),
                Duration::from_secs(300),
                64,
            )
            .unwrap(),
        );

        let streaming = Arc::new(streaming);
        let clock = Arc::new(ManualClock::at_epoch(1_000_000));

        let streaming_api: Arc<dyn StreamingApi> = streaming.clone();
        let clock_api: Arc<dyn Clock> = clock.clone();
        let dispatcher = MotionDispatcher::new(
            sensors.clone(),
            users.clone(),
            events.clone(),
            Arc::clone(&registry),
            Arc::clone(&secrets),
            streaming_api,
            clock_api,
            30,
            Duration::from_secs(15),
        );

        Self {
            sensors,
            users,
            events,
            registry,
            secrets,
            streaming,
            clock,
            dispatcher,
            _secrets_dir: secrets_dir,
        }
    }
}

/// Insert a user, writing a token bundle when `connected`.
pub async fn seed_user(harness: &TestHarness, user_id: &str, active: bool, connected: bool) {
    let secret_ref = format!("spotify-tokens-{user_id}");
    if connected {
        harness
            .secrets
            .put(
                &secret_ref,
                &TokenBundle {
                    access_token: format!("access-{user_id}"),
                    refresh_token: format!("refresh-{user_id}"),
                    expires_at: Some("2030-01-01T00:00:00Z".into()),
                    scope: Some("user-modify-playback-state".into()),
                    token_type: Some("Bearer".into()),
                    last_refreshed: None,
                    extra: serde_json::Map::new(),
                },
            )
            .await
            .unwrap();
    }

    harness
        .users
        .put(&User {
            user_id: user_id.into(),
            email: format!("{user_id}@example.com"),
            active,
            spotify_connected: connected,
            spotify_token_secret_ref: connected.then_some(secret_ref),
            utc_offset_minutes: None,
        })
        .await
        .unwrap();
}

/// Insert a sensor with playback-ready defaults, customised by `mutate`.
pub async fn seed_sensor(
    harness: &TestHarness,
    sensor_id: &str,
    user_id: &str,
    mutate: impl FnOnce(&mut Sensor),
) {
    let mut sensor = Sensor {
        sensor_id: sensor_id.into(),
        user_id: user_id.into(),
        name: sensor_id.into(),
        location: None,
        enabled: true,
        timeout_minutes: 5,
        motion_debounce_minutes: 2,
        quiet_hours: None,
        spotify_config: SpotifyConfig {
            device_id: Some("d1".into()),
            playlist_uri: Some("spotify:playlist:P".into()),
            shuffle: true,
            volume_percent: None,
        },
        last_motion_time: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    mutate(&mut sensor);
    harness.sensors.put(&sensor).await.unwrap();
}
