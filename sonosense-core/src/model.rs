//! Domain entities shared by the store and the engine.
//!
//! Records are keyed by stable identifiers; instants are kept as epoch
//! seconds wherever they participate in range queries, and as ISO-8601
//! strings where they are purely informational.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Minimum and maximum accepted sensor id length.
const SENSOR_ID_MIN_LEN: usize = 3;
const SENSOR_ID_MAX_LEN: usize = 128;

/// Validate a sensor identifier: 3-128 chars of `[A-Za-z0-9_-]`.
///
/// # Errors
///
/// Returns [`CoreError::Validation`] when the id is malformed.
pub fn validate_sensor_id(sensor_id: &str) -> Result<()> {
    if sensor_id.len() < SENSOR_ID_MIN_LEN || sensor_id.len() > SENSOR_ID_MAX_LEN {
        return Err(CoreError::Validation {
            field: "sensorId".into(),
            message: format!(
                "length must be between {SENSOR_ID_MIN_LEN} and {SENSOR_ID_MAX_LEN} characters"
            ),
        });
    }
    if !sensor_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CoreError::Validation {
            field: "sensorId".into(),
            message: "only letters, digits, '_' and '-' are allowed".into(),
        });
    }
    Ok(())
}

/// Per-sensor window in which motion is recorded but never triggers playback.
///
/// `start`/`end` are wall-clock `"HH:MM"` strings. A window with
/// `start >= end` wraps midnight. `days` holds day-of-week numbers
/// (0 = Sunday); an empty set means every day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub days: Vec<u8>,
}

impl QuietHours {
    /// Whether the given local time falls inside the quiet window.
    ///
    /// Window semantics: with `start < end` in-window means
    /// `start <= t < end`; with `start >= end` (midnight wrap) in-window
    /// means `t >= start || t < end`. Unparseable boundaries disable the
    /// window rather than blocking playback forever.
    #[must_use]
    pub fn contains(&self, at: DateTime<FixedOffset>) -> bool {
        if !self.enabled {
            return false;
        }
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        if !self.days.is_empty() {
            #[allow(clippy::cast_possible_truncation)]
            let day = at.weekday().num_days_from_sunday() as u8;
            if !self.days.contains(&day) {
                return false;
            }
        }
        let t = at.hour() * 60 + at.minute();
        if start < end {
            t >= start && t < end
        } else {
            t >= start || t < end
        }
    }
}

/// Parse a `"HH:MM"` string into minutes since midnight.
fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Spotify playback settings attached to a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotifyConfig {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub playlist_uri: Option<String>,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

const fn default_shuffle() -> bool {
    true
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            playlist_uri: None,
            shuffle: default_shuffle(),
            volume_percent: None,
        }
    }
}

/// A physical presence detector owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub sensor_id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    pub enabled: bool,
    pub timeout_minutes: u32,
    pub motion_debounce_minutes: u32,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub spotify_config: SpotifyConfig,
    /// Epoch seconds of the last accepted motion; drives the debounce gate.
    #[serde(default)]
    pub last_motion_time: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An account that owns sensors and a Spotify connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub active: bool,
    pub spotify_connected: bool,
    /// Opaque handle into the secret store; set iff `spotify_connected`.
    #[serde(default)]
    pub spotify_token_secret_ref: Option<String>,
    /// Offset from UTC in minutes for quiet-hours evaluation; UTC when absent.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

impl User {
    /// Fixed offset used to localise quiet-hours checks for this user.
    #[must_use]
    pub fn tz_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes.saturating_mul(60)))
            .unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A contiguous period of detected presence at one sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub sensor_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    /// Epoch seconds; also kept ISO-encoded in the store for read-back.
    pub start_time: i64,
    pub last_motion_time: i64,
    pub motion_events_count: i64,
    pub playback_started: bool,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub duration_minutes: Option<f64>,
    pub updated_at: DateTime<Utc>,
    /// Epoch second after which the record may be purged.
    pub ttl: i64,
}

/// Duration between two epoch seconds in minutes, rounded to two decimals.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn duration_minutes(start_epoch: i64, end_epoch: i64) -> f64 {
    let secs = end_epoch.saturating_sub(start_epoch).max(0);
    (secs as f64 / 60.0 * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MotionDetected,
    MotionCleared,
    Heartbeat,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MotionDetected => "motion_detected",
            Self::MotionCleared => "motion_cleared",
            Self::Heartbeat => "heartbeat",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "motion_detected" => Some(Self::MotionDetected),
            "motion_cleared" => Some(Self::MotionCleared),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Terminal outcome of one dispatcher invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    IgnoredDisabled,
    IgnoredQuietHours,
    IgnoredDebounce,
    PlaybackStarted,
    AlreadyPlaying,
    PlaybackResumed,
    Error,
}

impl ActionTaken {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IgnoredDisabled => "ignored_disabled",
            Self::IgnoredQuietHours => "ignored_quiet_hours",
            Self::IgnoredDebounce => "ignored_debounce",
            Self::PlaybackStarted => "playback_started",
            Self::AlreadyPlaying => "already_playing",
            Self::PlaybackResumed => "playback_resumed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ignored_disabled" => Some(Self::IgnoredDisabled),
            "ignored_quiet_hours" => Some(Self::IgnoredQuietHours),
            "ignored_debounce" => Some(Self::IgnoredDebounce),
            "playback_started" => Some(Self::PlaybackStarted),
            "already_playing" => Some(Self::AlreadyPlaying),
            "playback_resumed" => Some(Self::PlaybackResumed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this outcome means a start/resume call actually went out.
    #[must_use]
    pub const fn triggered_playback(self) -> bool {
        matches!(self, Self::PlaybackStarted | Self::PlaybackResumed)
    }
}

/// Append-only audit record of one dispatcher invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionEvent {
    pub event_id: String,
    pub sensor_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub event_type: EventType,
    pub timestamp: i64,
    pub action_taken: ActionTaken,
    pub playback_triggered: bool,
    #[serde(default)]
    pub battery_level: Option<i64>,
    #[serde(default)]
    pub signal_strength: Option<i64>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    pub ttl: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn local(hhmm: &str, weekday_offset_days: i64) -> DateTime<FixedOffset> {
        // 2026-01-04 is a Sunday.
        let (h, m) = hhmm.split_once(':').unwrap();
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 4, h.parse().unwrap(), m.parse().unwrap(), 0)
            .unwrap()
            + chrono::Duration::days(weekday_offset_days)
    }

    #[test]
    fn test_validate_sensor_id_accepts_typical_ids() {
        assert!(validate_sensor_id("bathroom_main").is_ok());
        assert!(validate_sensor_id("s-1").is_ok());
    }

    #[test]
    fn test_validate_sensor_id_rejects_short_and_bad_chars() {
        assert!(validate_sensor_id("ab").is_err());
        assert!(validate_sensor_id("has space").is_err());
        assert!(validate_sensor_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("22:00"), Some(22 * 60));
        assert_eq!(parse_hhmm("07:30"), Some(7 * 60 + 30));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("2200"), None);
    }

    #[test]
    fn test_quiet_hours_simple_window() {
        let qh = QuietHours {
            enabled: true,
            start: "13:00".into(),
            end: "15:00".into(),
            days: vec![],
        };
        assert!(qh.contains(local("13:00", 0)));
        assert!(qh.contains(local("14:59", 0)));
        assert!(!qh.contains(local("15:00", 0)));
        assert!(!qh.contains(local("12:59", 0)));
    }

    #[test]
    fn test_quiet_hours_wraps_midnight() {
        let qh = QuietHours {
            enabled: true,
            start: "22:00".into(),
            end: "07:00".into(),
            days: vec![],
        };
        assert!(qh.contains(local("23:30", 0)));
        assert!(qh.contains(local("06:59", 0)));
        assert!(!qh.contains(local("07:00", 0)));
        assert!(!qh.contains(local("12:00", 0)));
    }

    #[test]
    fn test_quiet_hours_disabled_never_matches() {
        let qh = QuietHours {
            enabled: false,
            start: "00:00".into(),
            end: "23:59".into(),
            days: vec![],
        };
        assert!(!qh.contains(local("12:00", 0)));
    }

    #[test]
    fn test_quiet_hours_day_filter() {
        // Sunday only (day 0); base date is a Sunday.
        let qh = QuietHours {
            enabled: true,
            start: "00:00".into(),
            end: "23:59".into(),
            days: vec![0],
        };
        assert!(qh.contains(local("12:00", 0)));
        assert!(!qh.contains(local("12:00", 1)));
    }

    #[test]
    fn test_duration_minutes_rounds_to_two_decimals() {
        assert!((duration_minutes(0, 600) - 10.0).abs() < f64::EPSILON);
        assert!((duration_minutes(0, 100) - 1.67).abs() < f64::EPSILON);
        assert!((duration_minutes(100, 50) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_action_taken_round_trip() {
        for action in [
            ActionTaken::IgnoredDisabled,
            ActionTaken::IgnoredQuietHours,
            ActionTaken::IgnoredDebounce,
            ActionTaken::PlaybackStarted,
            ActionTaken::AlreadyPlaying,
            ActionTaken::PlaybackResumed,
            ActionTaken::Error,
        ] {
            assert_eq!(ActionTaken::parse(action.as_str()), Some(action));
        }
        assert_eq!(ActionTaken::parse("bogus"), None);
    }

    #[test]
    fn test_user_tz_offset_defaults_to_utc() {
        let user = User {
            user_id: "u1".into(),
            email: "u1@example.com".into(),
            active: true,
            spotify_connected: false,
            spotify_token_secret_ref: None,
            utc_offset_minutes: None,
        };
        assert_eq!(user.tz_offset().local_minus_utc(), 0);

        let user = User {
            utc_offset_minutes: Some(-300),
            ..user
        };
        assert_eq!(user.tz_offset().local_minus_utc(), -300 * 60);
    }
}
