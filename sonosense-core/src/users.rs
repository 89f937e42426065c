use crate::db::Database;
use crate::error::Result;
use crate::model::User;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

/// Store for [`User`] records.
#[derive(Clone)]
pub struct UserStore {
    conn: Connection,
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        email: row.get(1)?,
        active: row.get(2)?,
        spotify_connected: row.get(3)?,
        spotify_token_secret_ref: row.get(4)?,
        utc_offset_minutes: row.get(5)?,
    })
}

const USER_COLUMNS: &str =
    "user_id, email, active, spotify_connected, spotify_token_secret_ref, utc_offset_minutes";

impl UserStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Look up a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, user_id: &str) -> Result<Option<User>> {
        let user_id = user_id.to_owned();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"
                ))?;
                let user = stmt
                    .query_row(rusqlite::params![user_id], row_to_user)
                    .optional()?;
                Ok(user)
            })
            .await
            .map_err(Into::into)
    }

    /// Insert or replace a user record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn put(&self, user: &User) -> Result<()> {
        let user = user.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO users (user_id, email, active, spotify_connected,
                                       spotify_token_secret_ref, utc_offset_minutes)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(user_id) DO UPDATE SET
                        email = excluded.email,
                        active = excluded.active,
                        spotify_connected = excluded.spotify_connected,
                        spotify_token_secret_ref = excluded.spotify_token_secret_ref,
                        utc_offset_minutes = excluded.utc_offset_minutes
                ",
                    rusqlite::params![
                        user.user_id,
                        user.email,
                        user.active,
                        user.spotify_connected,
                        user.spotify_token_secret_ref,
                        user.utc_offset_minutes,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// All users with `active` and `spotify_connected` set; the token
    /// refresher's work list.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_active_connected(&self) -> Result<Vec<User>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE active = 1 AND spotify_connected = 1
                     ORDER BY user_id"
                ))?;
                let users = stmt
                    .query_map([], row_to_user)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(users)
            })
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn user(id: &str, active: bool, connected: bool) -> User {
        User {
            user_id: id.into(),
            email: format!("{id}@example.com"),
            active,
            spotify_connected: connected,
            spotify_token_secret_ref: connected.then(|| format!("spotify-tokens-{id}")),
            utc_offset_minutes: None,
        }
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let store = UserStore::new(&db);

        store.put(&user("u1", true, true)).await.unwrap();
        let loaded = store.get("u1").await.unwrap().unwrap();
        assert!(loaded.active);
        assert_eq!(
            loaded.spotify_token_secret_ref.as_deref(),
            Some("spotify-tokens-u1")
        );

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_active_connected_filters() {
        let db = Database::open_in_memory().await.unwrap();
        let store = UserStore::new(&db);

        store.put(&user("u1", true, true)).await.unwrap();
        store.put(&user("u2", false, true)).await.unwrap();
        store.put(&user("u3", true, false)).await.unwrap();

        let users = store.list_active_connected().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "u1");
    }
}
