use crate::error::Result;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r"
-- Presence sensors, one row per registered device
CREATE TABLE IF NOT EXISTS sensors (
    sensor_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    location TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    timeout_minutes INTEGER NOT NULL DEFAULT 5,
    motion_debounce_minutes INTEGER NOT NULL DEFAULT 2,
    quiet_hours TEXT,
    spotify_config TEXT NOT NULL DEFAULT '{}',
    last_motion_time INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    spotify_connected INTEGER NOT NULL DEFAULT 0,
    spotify_token_secret_ref TEXT,
    utc_offset_minutes INTEGER
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    sensor_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    start_time_iso TEXT NOT NULL,
    last_motion_time INTEGER NOT NULL,
    motion_events_count INTEGER NOT NULL DEFAULT 1,
    playback_started INTEGER NOT NULL DEFAULT 0,
    end_time INTEGER,
    duration_minutes REAL,
    updated_at TEXT NOT NULL,
    ttl INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS motion_events (
    event_id TEXT PRIMARY KEY,
    sensor_id TEXT NOT NULL,
    user_id TEXT,
    session_id TEXT,
    event_type TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    timestamp_iso TEXT NOT NULL,
    action_taken TEXT NOT NULL,
    playback_triggered INTEGER NOT NULL DEFAULT 0,
    battery_level INTEGER,
    signal_strength INTEGER,
    firmware_version TEXT,
    ttl INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sensors_user ON sensors(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_sensor_start ON sessions(sensor_id, start_time DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_events_sensor_time ON motion_events(sensor_id, timestamp DESC);

-- Serialisation point for the one-active-session-per-sensor invariant:
-- concurrent creators race on this index and exactly one insert wins.
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
    ON sessions(sensor_id) WHERE status = 'active';
";

/// Handle to the engine's SQLite database.
///
/// The wrapped [`Connection`] is cheaply cloneable; each store and the
/// session registry hold their own clone. All coordination between the
/// dispatcher, sweeper and refresher flows through this database - the
/// engine keeps no shared mutable state in memory.
#[derive(Clone)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database at the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or opened.
    pub async fn new() -> Result<Self> {
        let db_path = crate::paths::store_db_path();
        Self::open(&db_path).await
    }

    /// Open a database at a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(path: &Path) -> Result<Self> {
        info!("Opening engine database at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// Open an in-memory database (used by tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        })
        .await?;

        info!("Engine database initialized");
        Ok(Self { conn })
    }

    /// Clone of the underlying connection for store construction.
    #[must_use]
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    /// Delete sessions and motion events whose `ttl` has passed.
    ///
    /// SQLite has no native record expiry, so the app runs this
    /// periodically. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleanup statements fail.
    pub async fn purge_expired(&self, now_epoch: i64) -> Result<usize> {
        let deleted = self
            .conn
            .call(move |conn| {
                let sessions = conn.execute(
                    "DELETE FROM sessions WHERE ttl < ?1 AND status = 'completed'",
                    rusqlite::params![now_epoch],
                )?;
                let events = conn.execute(
                    "DELETE FROM motion_events WHERE ttl < ?1",
                    rusqlite::params![now_epoch],
                )?;
                Ok(sessions + events)
            })
            .await?;

        if deleted > 0 {
            debug!("Purged {} expired records", deleted);
        }
        Ok(deleted)
    }

    /// Checkpoint WAL for clean shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL checkpoint fails.
    pub async fn checkpoint(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }
}
