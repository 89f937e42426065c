//! Motion event dispatch: the gate pipeline that turns one envelope into
//! at most one playback action plus an audit record.
//!
//! Gate order matters: parse, load sensor, load user, enabled, quiet
//! hours, debounce, session open/extend, token fetch, playback decision,
//! state writes. Each gate either short-circuits with a terminal action or
//! passes through. Failures past the parse gate are recorded as `error`
//! audit events and acknowledged - they never propagate to the transport.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sonosense_core::clock::Clock;
use sonosense_core::envelope::MotionEnvelope;
use sonosense_core::error::{CoreError, Result};
use sonosense_core::events::EventStore;
use sonosense_core::model::{validate_sensor_id, ActionTaken, MotionEvent, Sensor, User};
use sonosense_core::secrets::SecretStore;
use sonosense_core::sensors::SensorStore;
use sonosense_core::streaming::{PlaybackState, StartPlayback, StreamingApi};
use sonosense_core::users::UserStore;
use sonosense_core::RequestContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

use crate::registry::SessionRegistry;

/// Response payload for one processed motion event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub action: ActionTaken,
    pub sensor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
}

/// Consumes motion envelopes one at a time.
pub struct MotionDispatcher {
    sensors: SensorStore,
    users: UserStore,
    events: EventStore,
    registry: Arc<SessionRegistry>,
    secrets: Arc<SecretStore>,
    streaming: Arc<dyn StreamingApi>,
    clock: Arc<dyn Clock>,
    ttl_days: u32,
    budget: Duration,
}

impl MotionDispatcher {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        sensors: SensorStore,
        users: UserStore,
        events: EventStore,
        registry: Arc<SessionRegistry>,
        secrets: Arc<SecretStore>,
        streaming: Arc<dyn StreamingApi>,
        clock: Arc<dyn Clock>,
        ttl_days: u32,
        budget: Duration,
    ) -> Self {
        Self {
            sensors,
            users,
            events,
            registry,
            secrets,
            streaming,
            clock,
            ttl_days,
            budget,
        }
    }

    /// Process one motion envelope end to end.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for a malformed envelope (the
    /// transport answers 400); all later failures are folded into an
    /// `error` outcome with a matching audit record.
    pub async fn handle(&self, envelope: &MotionEnvelope) -> Result<DispatchOutcome> {
        // Gate 1: parse & validate.
        validate_sensor_id(&envelope.sensor_id)?;
        let now = envelope.timestamp.unwrap_or_else(|| self.clock.now());

        let mut ctx = RequestContext::new().with_sensor(&envelope.sensor_id);
        let span = ctx.span();

        async {
            match tokio::time::timeout(self.budget, self.process(envelope, now, &mut ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Dispatch budget exceeded for sensor {}", envelope.sensor_id);
                    Ok(self
                        .finish(
                            envelope,
                            now,
                            None,
                            None,
                            ActionTaken::Error,
                            "dispatch deadline exceeded",
                        )
                        .await)
                }
            }
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_lines)]
    async fn process(
        &self,
        envelope: &MotionEnvelope,
        now: DateTime<Utc>,
        ctx: &mut RequestContext,
    ) -> Result<DispatchOutcome> {
        let sensor_id = &envelope.sensor_id;

        // Gate 2: load sensor.
        let Some(sensor) = self.sensors.get(sensor_id).await? else {
            warn!("Motion event for unknown sensor {}", sensor_id);
            return Ok(self
                .finish(envelope, now, None, None, ActionTaken::Error, "sensor not found")
                .await);
        };
        let user_id = sensor.user_id.clone();
        ctx.set_user(&user_id);

        // Gate 3: load user.
        let Some(user) = self.users.get(&user_id).await? else {
            warn!("Sensor {} references unknown user {}", sensor_id, user_id);
            return Ok(self
                .finish(
                    envelope,
                    now,
                    Some(user_id),
                    None,
                    ActionTaken::Error,
                    "user not found",
                )
                .await);
        };

        // Gate 4: enabled.
        if !sensor.enabled {
            info!("Sensor {} is disabled, ignoring motion event", sensor_id);
            return Ok(self
                .finish(
                    envelope,
                    now,
                    Some(user_id),
                    None,
                    ActionTaken::IgnoredDisabled,
                    "sensor is disabled",
                )
                .await);
        }

        // Gate 5: quiet hours, evaluated in the user's local offset.
        if let Some(ref quiet_hours) = sensor.quiet_hours {
            let local = now.with_timezone(&user.tz_offset());
            if quiet_hours.contains(local) {
                info!("Motion during quiet hours on sensor {}, ignoring", sensor_id);
                return Ok(self
                    .finish(
                        envelope,
                        now,
                        Some(user_id),
                        None,
                        ActionTaken::IgnoredQuietHours,
                        "motion detected during quiet hours",
                    )
                    .await);
            }
        }

        // Gate 6: debounce. A sensor with no recorded motion never debounces.
        if let Some(last_motion) = sensor.last_motion_time {
            let elapsed = now.timestamp().saturating_sub(last_motion);
            if elapsed < i64::from(sensor.motion_debounce_minutes) * 60 {
                info!(
                    "Motion within debounce window on sensor {} ({}s since last), ignoring",
                    sensor_id, elapsed
                );
                return Ok(self
                    .finish(
                        envelope,
                        now,
                        Some(user_id),
                        None,
                        ActionTaken::IgnoredDebounce,
                        "motion detected within debounce period",
                    )
                    .await);
            }
        }

        // Gate 7: open or extend the session.
        let open = match self.registry.open_or_extend(sensor_id, &user_id, now).await {
            Ok(open) => open,
            Err(e) => {
                warn!("Session open failed for sensor {}: {}", sensor_id, e);
                return Ok(self
                    .finish(
                        envelope,
                        now,
                        Some(user_id),
                        None,
                        ActionTaken::Error,
                        "could not open session",
                    )
                    .await);
            }
        };
        let session_id = open.session_id.clone();
        ctx.set_session(&session_id);

        // Gate 8: fetch the user's access token.
        let Some(access_token) = self.access_token_for(&user).await else {
            warn!("User {} has no usable Spotify credentials", user_id);
            return Ok(self
                .finish(
                    envelope,
                    now,
                    Some(user_id),
                    Some(session_id),
                    ActionTaken::Error,
                    "no Spotify credentials",
                )
                .await);
        };

        // Gate 9: playback decision.
        let action = match self.decide_playback(&sensor, &access_token).await {
            Ok(action) => action,
            Err(e) => {
                warn!("Playback decision failed for sensor {}: {}", sensor_id, e);
                let message = match e {
                    CoreError::NoDeviceConfigured { .. } => "no Spotify device configured",
                    _ => "streaming call failed",
                };
                return Ok(self
                    .finish(
                        envelope,
                        now,
                        Some(user_id),
                        Some(session_id),
                        ActionTaken::Error,
                        message,
                    )
                    .await);
            }
        };

        // Step 10: state writes, best-effort in this order.
        if let Err(e) = self
            .sensors
            .touch_last_motion(sensor_id, now.timestamp())
            .await
        {
            warn!("Failed to update last motion time for {}: {}", sensor_id, e);
        }
        if action.triggered_playback() {
            if let Err(e) = self.registry.mark_playback_started(&session_id).await {
                warn!("Failed to mark playback started on {}: {}", session_id, e);
            }
        }

        info!(
            "Motion event processed for sensor {}: {} (request {}, session {})",
            sensor_id,
            action.as_str(),
            ctx.request_id,
            session_id
        );
        Ok(self
            .finish(
                envelope,
                now,
                Some(user_id),
                Some(session_id),
                action,
                "motion event processed",
            )
            .await)
    }

    /// Read the user's access token; `None` when the secret ref is missing,
    /// unreadable, or holds an empty token.
    async fn access_token_for(&self, user: &User) -> Option<String> {
        let secret_ref = user.spotify_token_secret_ref.as_deref()?;
        match self.secrets.get(secret_ref).await {
            Ok(bundle) if !bundle.access_token.is_empty() => Some(bundle.access_token),
            Ok(_) => None,
            Err(e) => {
                warn!("Secret read failed for user {}: {}", user.user_id, e);
                None
            }
        }
    }

    /// Check the current playback state and start playback when idle.
    async fn decide_playback(&self, sensor: &Sensor, access_token: &str) -> Result<ActionTaken> {
        let state = self.streaming.playback_state(access_token).await?;

        if state.as_ref().is_some_and(|s| s.is_playing) {
            return Ok(ActionTaken::AlreadyPlaying);
        }

        let Some(device_id) = sensor.spotify_config.device_id.clone() else {
            return Err(CoreError::NoDeviceConfigured {
                sensor_id: sensor.sensor_id.clone(),
            });
        };

        let request = StartPlayback {
            device_id: Some(device_id),
            context_uri: sensor.spotify_config.playlist_uri.clone(),
            shuffle: Some(sensor.spotify_config.shuffle),
            volume_percent: sensor.spotify_config.volume_percent,
        };
        self.streaming.start_playback(access_token, &request).await?;

        if state.as_ref().is_some_and(PlaybackState::is_paused_with_context) {
            Ok(ActionTaken::PlaybackResumed)
        } else {
            Ok(ActionTaken::PlaybackStarted)
        }
    }

    /// Append the audit record and build the response payload.
    async fn finish(
        &self,
        envelope: &MotionEnvelope,
        now: DateTime<Utc>,
        user_id: Option<String>,
        session_id: Option<String>,
        action: ActionTaken,
        message: &str,
    ) -> DispatchOutcome {
        let suffix: u32 = rand::thread_rng().gen();
        let event = MotionEvent {
            event_id: format!("evt-{}-{suffix:08x}", now.timestamp()),
            sensor_id: envelope.sensor_id.clone(),
            user_id,
            session_id: session_id.clone(),
            event_type: envelope.event_type,
            timestamp: now.timestamp(),
            action_taken: action,
            playback_triggered: action.triggered_playback(),
            battery_level: envelope.battery_level(),
            signal_strength: envelope.signal_strength(),
            firmware_version: envelope.firmware_version(),
            ttl: now.timestamp() + i64::from(self.ttl_days) * 24 * 60 * 60,
        };
        self.events.append_best_effort(&event).await;

        DispatchOutcome {
            action,
            sensor_id: envelope.sensor_id.clone(),
            session_id,
            message: message.to_owned(),
        }
    }
}
