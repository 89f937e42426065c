use crate::db::Database;
use crate::error::Result;
use crate::model::{QuietHours, Sensor, SpotifyConfig};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::debug;

/// Store for [`Sensor`] records.
#[derive(Clone)]
pub struct SensorStore {
    conn: Connection,
}

fn json_field<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_iso(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn row_to_sensor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sensor> {
    let quiet_hours: Option<QuietHours> = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(json_field(7, &raw)?),
        None => None,
    };
    let spotify_config: SpotifyConfig = json_field(8, &row.get::<_, String>(8)?)?;

    Ok(Sensor {
        sensor_id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        location: row.get(3)?,
        enabled: row.get(4)?,
        timeout_minutes: row.get(5)?,
        motion_debounce_minutes: row.get(6)?,
        quiet_hours,
        spotify_config,
        last_motion_time: row.get(9)?,
        created_at: parse_iso(&row.get::<_, String>(10)?),
        updated_at: parse_iso(&row.get::<_, String>(11)?),
    })
}

const SENSOR_COLUMNS: &str = "sensor_id, user_id, name, location, enabled, timeout_minutes,
        motion_debounce_minutes, quiet_hours, spotify_config, last_motion_time,
        created_at, updated_at";

impl SensorStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Look up a sensor by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, sensor_id: &str) -> Result<Option<Sensor>> {
        let sensor_id = sensor_id.to_owned();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {SENSOR_COLUMNS} FROM sensors WHERE sensor_id = ?1"
                ))?;
                let sensor = stmt
                    .query_row(rusqlite::params![sensor_id], row_to_sensor)
                    .optional()?;
                Ok(sensor)
            })
            .await
            .map_err(Into::into)
    }

    /// Insert or replace a sensor record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn put(&self, sensor: &Sensor) -> Result<()> {
        let quiet_hours = sensor
            .quiet_hours
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let spotify_config = serde_json::to_string(&sensor.spotify_config)?;
        let sensor = sensor.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO sensors (sensor_id, user_id, name, location, enabled, timeout_minutes,
                                         motion_debounce_minutes, quiet_hours, spotify_config,
                                         last_motion_time, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    ON CONFLICT(sensor_id) DO UPDATE SET
                        user_id = excluded.user_id,
                        name = excluded.name,
                        location = excluded.location,
                        enabled = excluded.enabled,
                        timeout_minutes = excluded.timeout_minutes,
                        motion_debounce_minutes = excluded.motion_debounce_minutes,
                        quiet_hours = excluded.quiet_hours,
                        spotify_config = excluded.spotify_config,
                        last_motion_time = excluded.last_motion_time,
                        updated_at = excluded.updated_at
                ",
                    rusqlite::params![
                        sensor.sensor_id,
                        sensor.user_id,
                        sensor.name,
                        sensor.location,
                        sensor.enabled,
                        sensor.timeout_minutes,
                        sensor.motion_debounce_minutes,
                        quiet_hours,
                        spotify_config,
                        sensor.last_motion_time,
                        sensor.created_at.to_rfc3339(),
                        sensor.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Advance a sensor's `last_motion_time`.
    ///
    /// Last-writer-wins is acceptable here because the value only feeds the
    /// debounce gate; `MAX` keeps the persisted sequence non-decreasing even
    /// when events arrive out of order.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn touch_last_motion(&self, sensor_id: &str, at_epoch: i64) -> Result<()> {
        let sensor_id = sensor_id.to_owned();
        let updated_at = Utc::now().to_rfc3339();
        debug!("Updating last_motion_time for {} to {}", sensor_id, at_epoch);

        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    UPDATE sensors
                    SET last_motion_time = MAX(COALESCE(last_motion_time, 0), ?2),
                        updated_at = ?3
                    WHERE sensor_id = ?1
                ",
                    rusqlite::params![sensor_id, at_epoch, updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_sensor() -> Sensor {
        Sensor {
            sensor_id: "bathroom_main".into(),
            user_id: "u1".into(),
            name: "Bathroom".into(),
            location: Some("upstairs".into()),
            enabled: true,
            timeout_minutes: 5,
            motion_debounce_minutes: 2,
            quiet_hours: Some(QuietHours {
                enabled: true,
                start: "22:00".into(),
                end: "07:00".into(),
                days: vec![],
            }),
            spotify_config: SpotifyConfig {
                device_id: Some("d1".into()),
                playlist_uri: Some("spotify:playlist:P".into()),
                shuffle: true,
                volume_percent: None,
            },
            last_motion_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let store = SensorStore::new(&db);

        store.put(&sample_sensor()).await.unwrap();

        let loaded = store.get("bathroom_main").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert!(loaded.enabled);
        assert_eq!(loaded.spotify_config.device_id.as_deref(), Some("d1"));
        assert_eq!(loaded.quiet_hours.unwrap().start, "22:00");
        assert!(loaded.last_motion_time.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_sensor() {
        let db = Database::open_in_memory().await.unwrap();
        let store = SensorStore::new(&db);
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_last_motion_is_monotone() {
        let db = Database::open_in_memory().await.unwrap();
        let store = SensorStore::new(&db);
        store.put(&sample_sensor()).await.unwrap();

        store.touch_last_motion("bathroom_main", 1_000_000).await.unwrap();
        assert_eq!(
            store.get("bathroom_main").await.unwrap().unwrap().last_motion_time,
            Some(1_000_000)
        );

        // An out-of-order write never moves the value backwards.
        store.touch_last_motion("bathroom_main", 999_000).await.unwrap();
        assert_eq!(
            store.get("bathroom_main").await.unwrap().unwrap().last_motion_time,
            Some(1_000_000)
        );

        store.touch_last_motion("bathroom_main", 1_000_060).await.unwrap();
        assert_eq!(
            store.get("bathroom_main").await.unwrap().unwrap().last_motion_time,
            Some(1_000_060)
        );
    }
}
