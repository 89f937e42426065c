use crate::db::Database;
use crate::error::Result;
use crate::model::{ActionTaken, EventType, MotionEvent};
use chrono::DateTime;
use tokio_rusqlite::Connection;
use tracing::warn;

/// Append-only store for [`MotionEvent`] audit records.
#[derive(Clone)]
pub struct EventStore {
    conn: Connection,
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<MotionEvent> {
    let event_type: String = row.get(4)?;
    let action_taken: String = row.get(6)?;
    Ok(MotionEvent {
        event_id: row.get(0)?,
        sensor_id: row.get(1)?,
        user_id: row.get(2)?,
        session_id: row.get(3)?,
        event_type: EventType::parse(&event_type).unwrap_or(EventType::MotionDetected),
        timestamp: row.get(5)?,
        action_taken: ActionTaken::parse(&action_taken).unwrap_or(ActionTaken::Error),
        playback_triggered: row.get(7)?,
        battery_level: row.get(8)?,
        signal_strength: row.get(9)?,
        firmware_version: row.get(10)?,
        ttl: row.get(11)?,
    })
}

const EVENT_COLUMNS: &str = "event_id, sensor_id, user_id, session_id, event_type, timestamp,
        action_taken, playback_triggered, battery_level, signal_strength, firmware_version, ttl";

impl EventStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Append one audit record.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn append(&self, event: &MotionEvent) -> Result<()> {
        let event = event.clone();
        let timestamp_iso = match DateTime::from_timestamp(event.timestamp, 0) {
            Some(dt) => dt.to_rfc3339(),
            None => String::new(),
        };

        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO motion_events (event_id, sensor_id, user_id, session_id, event_type,
                                               timestamp, timestamp_iso, action_taken, playback_triggered,
                                               battery_level, signal_strength, firmware_version, ttl)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
                    rusqlite::params![
                        event.event_id,
                        event.sensor_id,
                        event.user_id,
                        event.session_id,
                        event.event_type.as_str(),
                        event.timestamp,
                        timestamp_iso,
                        event.action_taken.as_str(),
                        event.playback_triggered,
                        event.battery_level,
                        event.signal_strength,
                        event.firmware_version,
                        event.ttl,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Append, logging instead of propagating on failure.
    ///
    /// The dispatcher's audit write is best-effort: a failed audit must not
    /// turn an otherwise processed motion event into an error.
    pub async fn append_best_effort(&self, event: &MotionEvent) {
        if let Err(e) = self.append(event).await {
            warn!(
                "Failed to append motion event {} for sensor {}: {}",
                event.event_id, event.sensor_id, e
            );
        }
    }

    /// Most recent events for a sensor, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_for_sensor(&self, sensor_id: &str, limit: u32) -> Result<Vec<MotionEvent>> {
        let sensor_id = sensor_id.to_owned();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {EVENT_COLUMNS} FROM motion_events
                     WHERE sensor_id = ?1
                     ORDER BY timestamp DESC, event_id DESC
                     LIMIT ?2"
                ))?;
                let events = stmt
                    .query_map(rusqlite::params![sensor_id, limit], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(events)
            })
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(id: &str, timestamp: i64, action: ActionTaken) -> MotionEvent {
        MotionEvent {
            event_id: id.into(),
            sensor_id: "s1".into(),
            user_id: Some("u1".into()),
            session_id: Some("session-1".into()),
            event_type: EventType::MotionDetected,
            timestamp,
            action_taken: action,
            playback_triggered: action.triggered_playback(),
            battery_level: Some(85),
            signal_strength: Some(-45),
            firmware_version: Some("1.4.2".into()),
            ttl: timestamp + 30 * 24 * 60 * 60,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let db = Database::open_in_memory().await.unwrap();
        let store = EventStore::new(&db);

        store
            .append(&event("e1", 1_000_000, ActionTaken::PlaybackStarted))
            .await
            .unwrap();
        store
            .append(&event("e2", 1_000_060, ActionTaken::IgnoredDebounce))
            .await
            .unwrap();

        let events = store.recent_for_sensor("s1", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "e2");
        assert_eq!(events[0].action_taken, ActionTaken::IgnoredDebounce);
        assert!(!events[0].playback_triggered);
        assert_eq!(events[1].action_taken, ActionTaken::PlaybackStarted);
        assert!(events[1].playback_triggered);
        assert_eq!(events[1].battery_level, Some(85));
    }

    #[tokio::test]
    async fn test_limit_respected() {
        let db = Database::open_in_memory().await.unwrap();
        let store = EventStore::new(&db);
        for i in 0..5 {
            store
                .append(&event(&format!("e{i}"), 1_000_000 + i, ActionTaken::Error))
                .await
                .unwrap();
        }
        let events = store.recent_for_sensor("s1", 3).await.unwrap();
        assert_eq!(events.len(), 3);
    }
}
