//! Scheduled pass that closes inactive sessions and pauses playback.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sonosense_core::clock::Clock;
use sonosense_core::error::Result;
use sonosense_core::model::{Sensor, Session};
use sonosense_core::secrets::SecretStore;
use sonosense_core::sensors::SensorStore;
use sonosense_core::streaming::{PlaybackState, StreamingApi};
use sonosense_core::users::UserStore;
use sonosense_core::CoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::registry::SessionRegistry;

/// One failed session in a sweep pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepError {
    pub session_id: String,
    pub message: String,
}

/// Per-pass summary emitted after every sweep.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub checked: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub paused: usize,
    pub completed: usize,
    pub errors: Vec<SweepError>,
}

#[derive(Debug)]
enum SessionSweep {
    /// Still within its timeout window.
    Skipped,
    /// Closed out; `timed_out` is false for orphaned sessions.
    Completed { timed_out: bool, paused: bool },
}

/// Periodically completes sessions whose last motion exceeds the sensor's
/// inactivity timeout, pausing playback first when it is still running on
/// the sensor's device.
pub struct TimeoutSweeper {
    registry: Arc<SessionRegistry>,
    sensors: SensorStore,
    users: UserStore,
    secrets: Arc<SecretStore>,
    streaming: Arc<dyn StreamingApi>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl TimeoutSweeper {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        sensors: SensorStore,
        users: UserStore,
        secrets: Arc<SecretStore>,
        streaming: Arc<dyn StreamingApi>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        cancel_token: Option<CancellationToken>,
    ) -> Self {
        Self {
            registry,
            sensors,
            users,
            secrets,
            streaming,
            clock,
            interval,
            cancel_token: cancel_token.unwrap_or_default(),
        }
    }

    /// Start the sweeper in a background task.
    #[must_use]
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(&self) {
        info!("Starting timeout sweeper (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Timeout sweeper shutting down");
                    break;
                }
                () = tokio::time::sleep(self.interval) => {
                    match self.sweep_once().await {
                        Ok(summary) => {
                            if summary.checked > 0 || !summary.errors.is_empty() {
                                info!(
                                    "Sweep complete: checked={} skipped={} timed_out={} paused={} completed={} errors={}",
                                    summary.checked,
                                    summary.skipped,
                                    summary.timed_out,
                                    summary.paused,
                                    summary.completed,
                                    summary.errors.len()
                                );
                            }
                        }
                        Err(e) => error!("Sweep pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass over all active sessions.
    ///
    /// Each session is processed independently: a failure for one lands in
    /// the summary's error list and never blocks the rest.
    ///
    /// # Errors
    ///
    /// Returns an error only when the active-session listing itself fails.
    pub async fn sweep_once(&self) -> Result<SweepSummary> {
        let sessions = self.registry.list_active().await?;
        let now = self.clock.now();

        let mut summary = SweepSummary {
            checked: sessions.len(),
            ..SweepSummary::default()
        };

        for session in sessions {
            match self.process_session(&session, now).await {
                Ok(SessionSweep::Skipped) => summary.skipped += 1,
                Ok(SessionSweep::Completed { timed_out, paused }) => {
                    summary.completed += 1;
                    if timed_out {
                        summary.timed_out += 1;
                    }
                    if paused {
                        summary.paused += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to process session {}: {}", session.session_id, e);
                    summary.errors.push(SweepError {
                        session_id: session.session_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }

    async fn process_session(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<SessionSweep> {
        // A session whose sensor is gone is orphaned: close it out without
        // touching playback.
        let Some(sensor) = self.sensors.get(&session.sensor_id).await? else {
            warn!(
                "Completing orphaned session {} (sensor {} is gone)",
                session.session_id, session.sensor_id
            );
            self.registry.complete(&session.session_id, now, false).await?;
            return Ok(SessionSweep::Completed {
                timed_out: false,
                paused: false,
            });
        };

        let last_motion = if session.last_motion_time > 0 {
            session.last_motion_time
        } else {
            session.start_time
        };
        let elapsed = now.timestamp().saturating_sub(last_motion);
        if elapsed < i64::from(sensor.timeout_minutes) * 60 {
            return Ok(SessionSweep::Skipped);
        }

        info!(
            "Session {} timed out ({}s since last motion, timeout {}min)",
            session.session_id, elapsed, sensor.timeout_minutes
        );

        // A user that disappeared is treated like a missing sensor: nothing
        // to pause against, complete the session as-is.
        let Some(user) = self.users.get(&session.user_id).await? else {
            warn!(
                "Completing session {} without pause (user {} is gone)",
                session.session_id, session.user_id
            );
            self.registry.complete(&session.session_id, now, false).await?;
            return Ok(SessionSweep::Completed {
                timed_out: true,
                paused: false,
            });
        };

        let secret_ref = user.spotify_token_secret_ref.as_deref().ok_or_else(|| {
            CoreError::NoSpotifyCredentials {
                user_id: user.user_id.clone(),
            }
        })?;
        let bundle = self.secrets.get(secret_ref).await?;

        let paused = self.pause_if_playing(&sensor, &bundle.access_token).await?;

        self.registry
            .complete(&session.session_id, now, paused)
            .await?;

        Ok(SessionSweep::Completed {
            timed_out: true,
            paused,
        })
    }

    /// Pause playback when it is running on this sensor's device. Playback
    /// on a different known device is left alone.
    async fn pause_if_playing(&self, sensor: &Sensor, access_token: &str) -> Result<bool> {
        let Some(state) = self.streaming.playback_state(access_token).await? else {
            return Ok(false);
        };
        if !state.is_playing {
            return Ok(false);
        }
        if !device_matches(sensor, &state) {
            info!(
                "Playback is on another device, leaving it running (sensor {})",
                sensor.sensor_id
            );
            return Ok(false);
        }

        self.streaming
            .pause_playback(access_token, sensor.spotify_config.device_id.as_deref())
            .await?;
        Ok(true)
    }
}

/// Whether current playback can be attributed to the sensor's configured
/// device. Unknown on either side counts as a match.
fn device_matches(sensor: &Sensor, state: &PlaybackState) -> bool {
    match (
        sensor.spotify_config.device_id.as_deref(),
        state.device.as_ref().and_then(|device| device.id.as_deref()),
    ) {
        (Some(configured), Some(active)) => configured == active,
        _ => true,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::{seed_sensor, seed_user, MockStreaming, TestHarness};
    use sonosense_core::model::SessionStatus;

    fn sweeper(harness: &TestHarness) -> TimeoutSweeper {
        let streaming: Arc<dyn StreamingApi> = harness.streaming.clone();
        let clock: Arc<dyn Clock> = harness.clock.clone();
        TimeoutSweeper::new(
            Arc::clone(&harness.registry),
            harness.sensors.clone(),
            harness.users.clone(),
            Arc::clone(&harness.secrets),
            streaming,
            clock,
            Duration::from_secs(60),
            None,
        )
    }

    #[tokio::test]
    async fn test_timed_out_session_paused_and_completed() {
        // Scenario: last motion 10 minutes ago, 5 minute timeout, playback
        // still running on the sensor's device.
        let harness = TestHarness::new(MockStreaming::playing("d1")).await;
        seed_user(&harness, "u1", true, true).await;
        seed_sensor(&harness, "s1", "u1", |sensor| {
            sensor.timeout_minutes = 5;
        })
        .await;

        let open = harness
            .registry
            .open_or_extend("s1", "u1", harness.clock.now())
            .await
            .unwrap();
        harness.clock.advance_secs(10 * 60);

        let summary = sweeper(&harness).sweep_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.paused, 1);
        assert_eq!(summary.completed, 1);
        assert!(summary.errors.is_empty());

        assert_eq!(
            harness.streaming.pause_calls(),
            vec![Some("d1".to_owned())]
        );

        let session = harness.registry.get(&open.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!((session.duration_minutes.unwrap() - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_recent_session_skipped() {
        let harness = TestHarness::new(MockStreaming::playing("d1")).await;
        seed_user(&harness, "u1", true, true).await;
        seed_sensor(&harness, "s1", "u1", |_| {}).await;

        harness
            .registry
            .open_or_extend("s1", "u1", harness.clock.now())
            .await
            .unwrap();
        harness.clock.advance_secs(60);

        let summary = sweeper(&harness).sweep_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.completed, 0);
        assert!(harness.streaming.pause_calls().is_empty());
    }

    #[tokio::test]
    async fn test_idle_playback_completes_without_pause() {
        let harness = TestHarness::new(MockStreaming::idle()).await;
        seed_user(&harness, "u1", true, true).await;
        seed_sensor(&harness, "s1", "u1", |_| {}).await;

        harness
            .registry
            .open_or_extend("s1", "u1", harness.clock.now())
            .await
            .unwrap();
        harness.clock.advance_secs(10 * 60);

        let summary = sweeper(&harness).sweep_once().await.unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.paused, 0);
        assert_eq!(summary.completed, 1);
        assert!(harness.streaming.pause_calls().is_empty());
    }

    #[tokio::test]
    async fn test_playback_on_other_device_left_running() {
        let harness = TestHarness::new(MockStreaming::playing("other-device")).await;
        seed_user(&harness, "u1", true, true).await;
        seed_sensor(&harness, "s1", "u1", |_| {}).await;

        harness
            .registry
            .open_or_extend("s1", "u1", harness.clock.now())
            .await
            .unwrap();
        harness.clock.advance_secs(10 * 60);

        let summary = sweeper(&harness).sweep_once().await.unwrap();
        assert_eq!(summary.paused, 0);
        assert_eq!(summary.completed, 1);
        assert!(harness.streaming.pause_calls().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_session_completed_immediately() {
        let harness = TestHarness::new(MockStreaming::playing("d1")).await;
        // Session exists but its sensor was deregistered.
        let open = harness
            .registry
            .open_or_extend("ghost", "u1", harness.clock.now())
            .await
            .unwrap();
        harness.clock.advance_secs(30);

        let summary = sweeper(&harness).sweep_once().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.timed_out, 0);
        assert!(harness.streaming.pause_calls().is_empty());

        let session = harness.registry.get(&open.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_per_session_errors_do_not_block_others() {
        let harness = TestHarness::new(MockStreaming::failing()).await;
        seed_user(&harness, "u1", true, true).await;
        seed_sensor(&harness, "s1", "u1", |_| {}).await;
        seed_sensor(&harness, "s2", "u1", |_| {}).await;

        harness
            .registry
            .open_or_extend("s1", "u1", harness.clock.now())
            .await
            .unwrap();
        harness
            .registry
            .open_or_extend("s2", "u1", harness.clock.now())
            .await
            .unwrap();
        harness.clock.advance_secs(10 * 60);

        let summary = sweeper(&harness).sweep_once().await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.completed, 0);

        // Both sessions stay active for the next pass.
        assert_eq!(harness.registry.list_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sweeper_tolerates_dispatcher_extension_race() {
        // The dispatcher may extend a session between listing and
        // completion; the conditional complete still lands correctly.
        let harness = TestHarness::new(MockStreaming::idle()).await;
        seed_user(&harness, "u1", true, true).await;
        seed_sensor(&harness, "s1", "u1", |_| {}).await;

        let open = harness
            .registry
            .open_or_extend("s1", "u1", harness.clock.now())
            .await
            .unwrap();
        harness.clock.advance_secs(10 * 60);

        // Motion arrives after the timeout but before the sweep.
        harness
            .registry
            .open_or_extend("s1", "u1", harness.clock.now())
            .await
            .unwrap();

        let summary = sweeper(&harness).sweep_once().await.unwrap();
        // The extension moved last motion forward, so the sweep skips it.
        assert_eq!(summary.skipped, 1);

        let session = harness.registry.get(&open.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.motion_events_count, 2);
    }
}
