//! Session lifecycle and the one-active-session-per-sensor invariant.
//!
//! The registry is the only writer of session records. Creation goes
//! through a conditional insert racing on a partial unique index over
//! `(sensor_id) WHERE status = 'active'`: at most one creator wins, and the
//! loser retries the lookup-and-extend path.

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::OptionalExtension;
use serde::Serialize;
use sonosense_core::db::Database;
use sonosense_core::error::{CoreError, Result};
use sonosense_core::model::{duration_minutes, Session, SessionStatus};
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

/// Attempts before a persistent create conflict surfaces as `Busy`.
const CREATE_RETRY_ATTEMPTS: u32 = 3;

const SESSION_COLUMNS: &str = "session_id, sensor_id, user_id, status, start_time,
        last_motion_time, motion_events_count, playback_started, end_time,
        duration_minutes, updated_at, ttl";

const ANALYTICS_FILTER_SQL: &str = "
       (?1 IS NULL OR sensor_id = ?1)
   AND (?2 IS NULL OR user_id = ?2)
   AND (?3 IS NULL OR start_time >= ?3)
   AND (?4 IS NULL OR start_time <= ?4)";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let updated_at: String = row.get(10)?;
    Ok(Session {
        session_id: row.get(0)?,
        sensor_id: row.get(1)?,
        user_id: row.get(2)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Completed),
        start_time: row.get(4)?,
        last_motion_time: row.get(5)?,
        motion_events_count: row.get(6)?,
        playback_started: row.get(7)?,
        end_time: row.get(8)?,
        duration_minutes: row.get(9)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
        ttl: row.get(11)?,
    })
}

fn get_session_row(conn: &rusqlite::Connection, session_id: &str) -> rusqlite::Result<Option<Session>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
    ))?;
    stmt.query_row(rusqlite::params![session_id], row_to_session)
        .optional()
}

fn is_constraint_violation(error: &tokio_rusqlite::Error) -> bool {
    matches!(
        error,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Result of [`SessionRegistry::open_or_extend`].
#[derive(Debug, Clone)]
pub struct OpenOrExtend {
    pub session_id: String,
    pub created: bool,
}

/// Filters for [`SessionRegistry::query_by_sensor`].
#[derive(Debug, Clone)]
pub struct SessionQuery {
    pub sensor_id: String,
    pub start_epoch: Option<i64>,
    pub end_epoch: Option<i64>,
    pub limit: u32,
    pub page_token: Option<String>,
}

/// One page of session query results, newest first.
#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub next_token: Option<String>,
}

/// Filters for [`SessionRegistry::analytics`].
#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilter {
    pub sensor_id: Option<String>,
    pub user_id: Option<String>,
    pub start_epoch: Option<i64>,
    pub end_epoch: Option<i64>,
}

/// Aggregate session statistics.
///
/// Averages are computed over completed sessions with a recorded duration;
/// with zero such sessions the averages are `0`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnalytics {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub completed_sessions: i64,
    pub total_motion_events: i64,
    pub total_duration_minutes: f64,
    pub average_duration_minutes: f64,
    pub average_motion_events_per_session: f64,
    pub peak_hour: Option<u8>,
    pub sessions_with_playback: i64,
}

/// Owner of session records.
#[derive(Clone)]
pub struct SessionRegistry {
    conn: Connection,
    ttl_days: u32,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(db: &Database, ttl_days: u32) -> Self {
        Self {
            conn: db.connection(),
            ttl_days,
        }
    }

    fn new_session_id(sensor_id: &str, epoch: i64) -> String {
        let suffix: u32 = rand::thread_rng().gen();
        format!("session-{sensor_id}-{epoch}-{suffix:08x}")
    }

    fn ttl_epoch(&self, now_epoch: i64) -> i64 {
        now_epoch + i64::from(self.ttl_days) * 24 * 60 * 60
    }

    /// Extend the sensor's active session, or create a fresh one when none
    /// exists. At most one creator wins the race; the loser lands on the
    /// extend path on retry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Busy`] after persistent create conflicts, or a
    /// store error.
    pub async fn open_or_extend(
        &self,
        sensor_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenOrExtend> {
        let now_epoch = now.timestamp();
        let now_iso = now.to_rfc3339();
        let ttl = self.ttl_epoch(now_epoch);

        for attempt in 1..=CREATE_RETRY_ATTEMPTS {
            let sensor_id_owned = sensor_id.to_owned();
            let user_id_owned = user_id.to_owned();
            let now_iso_cloned = now_iso.clone();
            let session_id = Self::new_session_id(sensor_id, now_epoch);

            let result = self
                .conn
                .call(move |conn| {
                    // Extend path: bump the active session if there is one.
                    let updated = conn.execute(
                        r"
                        UPDATE sessions
                        SET motion_events_count = motion_events_count + 1,
                            last_motion_time = ?2,
                            updated_at = ?3
                        WHERE sensor_id = ?1 AND status = 'active'
                    ",
                        rusqlite::params![sensor_id_owned, now_epoch, now_iso_cloned],
                    )?;
                    if updated > 0 {
                        let existing: String = conn.query_row(
                            "SELECT session_id FROM sessions WHERE sensor_id = ?1 AND status = 'active'",
                            rusqlite::params![sensor_id_owned],
                            |row| row.get(0),
                        )?;
                        return Ok(Some(OpenOrExtend {
                            session_id: existing,
                            created: false,
                        }));
                    }

                    // Create path: the partial unique index is the
                    // "no active session exists" condition.
                    conn.execute(
                        r"
                        INSERT INTO sessions (session_id, sensor_id, user_id, status, start_time,
                                              start_time_iso, last_motion_time, motion_events_count,
                                              playback_started, updated_at, ttl)
                        VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?4, 1, 0, ?5, ?6)
                    ",
                        rusqlite::params![
                            session_id,
                            sensor_id_owned,
                            user_id_owned,
                            now_epoch,
                            now_iso_cloned,
                            ttl
                        ],
                    )?;
                    Ok(Some(OpenOrExtend {
                        session_id,
                        created: true,
                    }))
                })
                .await;

            match result {
                Ok(Some(outcome)) => {
                    if outcome.created {
                        info!(
                            "Opened session {} for sensor {}",
                            outcome.session_id, sensor_id
                        );
                    } else {
                        debug!(
                            "Extended session {} for sensor {}",
                            outcome.session_id, sensor_id
                        );
                    }
                    return Ok(outcome);
                }
                Ok(None) => {}
                Err(e) if is_constraint_violation(&e) => {
                    // Another creator won between our extend and insert.
                    warn!(
                        "Session create conflict for sensor {} (attempt {}/{})",
                        sensor_id, attempt, CREATE_RETRY_ATTEMPTS
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CoreError::Busy {
            sensor_id: sensor_id.to_owned(),
        })
    }

    /// Record that playback was started for this session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_playback_started(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_owned();
        let now_iso = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    UPDATE sessions
                    SET playback_started = 1, updated_at = ?2
                    WHERE session_id = ?1 AND playback_started = 0
                ",
                    rusqlite::params![session_id, now_iso],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Complete a session, stamping its end time and duration.
    ///
    /// Conditional on `status = 'active'`; completing an already-completed
    /// session is a no-op that returns the existing record, so the sweeper
    /// and an operator action can race safely.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ResourceNotFound`] for an unknown session id, or
    /// a store error.
    pub async fn complete(
        &self,
        session_id: &str,
        end_time: DateTime<Utc>,
        playback_stopped: bool,
    ) -> Result<Session> {
        let session_id_owned = session_id.to_owned();
        let end_epoch = end_time.timestamp();
        let now_iso = end_time.to_rfc3339();

        let completed = self
            .conn
            .call(move |conn| {
                let Some(session) = get_session_row(conn, &session_id_owned)? else {
                    return Ok(None);
                };
                if session.status == SessionStatus::Completed {
                    return Ok(Some(session));
                }

                let duration = duration_minutes(session.start_time, end_epoch);
                conn.execute(
                    r"
                    UPDATE sessions
                    SET status = 'completed', end_time = ?2, duration_minutes = ?3, updated_at = ?4
                    WHERE session_id = ?1 AND status = 'active'
                ",
                    rusqlite::params![session_id_owned, end_epoch, duration, now_iso],
                )?;
                Ok(get_session_row(conn, &session_id_owned)?)
            })
            .await?;

        let session = completed.ok_or_else(|| CoreError::ResourceNotFound {
            resource: "Session",
            id: session_id.to_owned(),
        })?;
        info!(
            "Session {} completed (duration: {:?} min, playback_stopped: {})",
            session.session_id, session.duration_minutes, playback_stopped
        );
        Ok(session)
    }

    /// Look up a session by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_owned();
        self.conn
            .call(move |conn| Ok(get_session_row(conn, &session_id)?))
            .await
            .map_err(Into::into)
    }

    /// All sessions with `status = 'active'`; the sweeper's work list.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_active(&self) -> Result<Vec<Session>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'active' ORDER BY start_time"
                ))?;
                let sessions = stmt
                    .query_map([], row_to_session)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(sessions)
            })
            .await
            .map_err(Into::into)
    }

    /// Page through a sensor's sessions, descending by start time.
    ///
    /// The page token encodes the last row of the previous page; passing it
    /// back resumes where that page ended.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for a malformed page token, or a
    /// store error.
    pub async fn query_by_sensor(&self, query: &SessionQuery) -> Result<SessionPage> {
        let (token_time, token_id) = match query.page_token.as_deref() {
            Some(token) => {
                let (time, id) = token.split_once(':').ok_or_else(|| CoreError::Validation {
                    field: "pageToken".into(),
                    message: "malformed page token".into(),
                })?;
                let time: i64 = time.parse().map_err(|_| CoreError::Validation {
                    field: "pageToken".into(),
                    message: "malformed page token".into(),
                })?;
                (Some(time), Some(id.to_owned()))
            }
            None => (None, None),
        };

        let sensor_id = query.sensor_id.clone();
        let start_epoch = query.start_epoch;
        let end_epoch = query.end_epoch;
        let limit = query.limit.max(1);
        let fetch = i64::from(limit) + 1;

        let mut sessions = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE sensor_id = ?1
                       AND (?2 IS NULL OR start_time >= ?2)
                       AND (?3 IS NULL OR start_time <= ?3)
                       AND (?4 IS NULL OR start_time < ?4
                            OR (start_time = ?4 AND session_id < ?5))
                     ORDER BY start_time DESC, session_id DESC
                     LIMIT ?6"
                ))?;
                let sessions = stmt
                    .query_map(
                        rusqlite::params![
                            sensor_id,
                            start_epoch,
                            end_epoch,
                            token_time,
                            token_id,
                            fetch
                        ],
                        row_to_session,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(sessions)
            })
            .await?;

        let page_len = usize::try_from(limit).unwrap_or(usize::MAX);
        let next_token = if sessions.len() > page_len {
            sessions.truncate(page_len);
            sessions
                .last()
                .map(|session| format!("{}:{}", session.start_time, session.session_id))
        } else {
            None
        };

        Ok(SessionPage {
            sessions,
            next_token,
        })
    }

    /// Aggregate statistics over sessions matching the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn analytics(&self, filter: &AnalyticsFilter) -> Result<SessionAnalytics> {
        let sensor_id = filter.sensor_id.clone();
        let user_id = filter.user_id.clone();
        let start_epoch = filter.start_epoch;
        let end_epoch = filter.end_epoch;

        self.conn
            .call(move |conn| {
                let params = rusqlite::params![sensor_id, user_id, start_epoch, end_epoch];

                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(motion_events_count), 0),
                            COALESCE(SUM(CASE WHEN status = 'completed' AND duration_minutes IS NOT NULL
                                             THEN duration_minutes ELSE 0 END), 0.0),
                            COALESCE(SUM(CASE WHEN status = 'completed' AND duration_minutes IS NOT NULL
                                             THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'completed' AND duration_minutes IS NOT NULL
                                             THEN motion_events_count ELSE 0 END), 0),
                            COALESCE(SUM(playback_started), 0)
                     FROM sessions WHERE {ANALYTICS_FILTER_SQL}"
                ))?;

                let (
                    total_sessions,
                    active_sessions,
                    completed_sessions,
                    total_motion_events,
                    total_duration_minutes,
                    measured_sessions,
                    measured_motion_events,
                    sessions_with_playback,
                ): (i64, i64, i64, i64, f64, i64, i64, i64) = stmt.query_row(params, |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?;

                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT CAST(strftime('%H', start_time, 'unixepoch') AS INTEGER) AS hour,
                            COUNT(*) AS n
                     FROM sessions WHERE {ANALYTICS_FILTER_SQL}
                     GROUP BY hour ORDER BY n DESC, hour ASC LIMIT 1"
                ))?;
                let peak_hour: Option<u8> = stmt
                    .query_row(params, |row| row.get::<_, u8>(0))
                    .optional()?;

                #[allow(clippy::cast_precision_loss)]
                let (average_duration_minutes, average_motion_events_per_session) =
                    if measured_sessions > 0 {
                        let n = measured_sessions as f64;
                        (
                            (total_duration_minutes / n * 100.0).round() / 100.0,
                            (measured_motion_events as f64 / n * 100.0).round() / 100.0,
                        )
                    } else {
                        (0.0, 0.0)
                    };

                Ok(SessionAnalytics {
                    total_sessions,
                    active_sessions,
                    completed_sessions,
                    total_motion_events,
                    total_duration_minutes,
                    average_duration_minutes,
                    average_motion_events_per_session,
                    peak_hour,
                    sessions_with_playback,
                })
            })
            .await
            .map_err(Into::into)
    }
}
